//! Routing masks — service id range filter and topic subscription bits.
//!
//! Ported line for line from `original_source/network/robus/src/robus.c`'s
//! `Robus_IDMaskCalculation` / `Robus_TopicSubscribe` / `Robus_TopicUnsubscribe`:
//! same bit arithmetic, rewritten as checked Rust instead of the C
//! `LUOS_ASSERT` + raw pointer math.

use crate::config::{ID_MASK_SIZE, LAST_TOPIC, MAX_SERVICE_NUMBER};
use crate::context::{RobusContext, Service};
use crate::error::{ConfigError, Result};

/// Port of `Robus_IDMaskCalculation`. `base_id` is 1-based (id `0` is the
/// unassigned sentinel); `count` is the number of contiguous service ids
/// this node owns starting at `base_id`.
pub fn id_mask_calculation(ctx: &mut RobusContext, base_id: u16, count: u16) -> Result<()> {
    if base_id == 0 || base_id as usize > 4096 - MAX_SERVICE_NUMBER {
        return Err(ConfigError::BadServiceId.into());
    }
    ctx.mask_init();
    ctx.id_shift_mask = (base_id - 1) / 8;
    for i in 0..count {
        let bit_index = (base_id - 1 + i) - 8 * ctx.id_shift_mask;
        let byte = (bit_index / 8) as usize;
        if byte >= ID_MASK_SIZE {
            return Err(ConfigError::BadServiceId.into());
        }
        ctx.id_mask[byte] |= 1 << (bit_index % 8);
    }
    Ok(())
}

fn topic_bit(mask: &mut [u8], topic: u16, set: bool) {
    let byte = (topic / 8) as usize;
    let bit = 1u8 << (topic % 8);
    if set {
        mask[byte] |= bit;
    } else {
        mask[byte] &= !bit;
    }
}

fn topic_bit_is_set(mask: &[u8], topic: u16) -> bool {
    let byte = (topic / 8) as usize;
    mask[byte] & (1 << (topic % 8)) != 0
}

/// Port of `Robus_TopicSubscribe`. Idempotent: subscribing twice leaves
/// both masks with the bit set and the service's private list unchanged
/// on the second call.
pub fn topic_subscribe(ctx: &mut RobusContext, service_idx: usize, topic: u16) -> Result<()> {
    if topic as usize > LAST_TOPIC {
        return Err(ConfigError::BadTopic.into());
    }
    topic_bit(&mut ctx.topic_mask, topic, true);
    let service = ctx
        .services
        .get_mut(service_idx)
        .ok_or(ConfigError::BadServiceId)?;
    service_topic_subscribe(service, topic)
}

fn service_topic_subscribe(service: &mut Service, topic: u16) -> Result<()> {
    if service.topic_list.contains(&topic) {
        return Ok(());
    }
    service
        .topic_list
        .push(topic)
        .map_err(|_| ConfigError::BadTopic)?;
    Ok(())
}

/// Port of `Robus_TopicUnsubscribe`. Clears the service's private bit
/// unconditionally; only clears the node-wide mask bit once no remaining
/// service subscribes to `topic`.
pub fn topic_unsubscribe(ctx: &mut RobusContext, service_idx: usize, topic: u16) -> Result<()> {
    if topic as usize > LAST_TOPIC {
        return Err(ConfigError::BadTopic.into());
    }
    {
        let service = ctx
            .services
            .get_mut(service_idx)
            .ok_or(ConfigError::BadServiceId)?;
        service.topic_list.retain(|&t| t != topic);
    }
    let still_subscribed = ctx.services.iter().any(|s| s.topic_list.contains(&topic));
    if !still_subscribed {
        topic_bit(&mut ctx.topic_mask, topic, false);
    }
    Ok(())
}

pub fn topic_is_set(mask: &[u8], topic: u16) -> bool {
    topic_bit_is_set(mask, topic)
}
