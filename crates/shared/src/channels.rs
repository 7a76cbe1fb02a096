//! Delivery guarantees and the logical channel registry.
//!
//! A channel is a stable logical stream: sequencing and ordering are scoped
//! to one channel id. Channels are global per message class; a channel per
//! tracked entity would defeat the sequencing contract, so entity position
//! updates share one sequenced channel and sort out per-entity ordering in
//! the synchronizer.

use std::{borrow::Cow, collections::HashMap};

use serde::{Deserialize, Serialize};

pub type ChannelId = u8;

/// Delivery guarantee requested for one message. Any backend must honor
/// these semantics or report the capability as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMethod {
    /// Fire and forget. May be dropped, duplicated or reordered.
    Unreliable,
    /// May be dropped; stale sequence numbers are discarded on receive.
    UnreliableSequenced,
    /// Always delivered, in any order.
    ReliableUnordered,
    /// Always delivered; out-of-date frames are discarded on receive.
    ReliableSequenced,
    /// Always delivered, in send order.
    ReliableOrdered,
}

impl DeliveryMethod {
    /// Whether the backend must retransmit until acknowledged.
    pub const fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }

    /// Whether the channel's sequence number is meaningful on receive.
    pub const fn is_sequenced(self) -> bool {
        matches!(
            self,
            DeliveryMethod::UnreliableSequenced
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }
}

/// Channel used for ownership, admin and full state sync traffic.
pub const CHANNEL_CONTROL: ChannelId = 0;
/// Channel used for chat and player status traffic.
pub const CHANNEL_STATUS: ChannelId = 1;
/// Channel used for entity position updates.
pub const CHANNEL_POSITION: ChannelId = 2;

/// Describes a single logical channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub delivery: DeliveryMethod,
    pub label: Cow<'static, str>,
    pub priority: u8,
}

impl ChannelDescriptor {
    pub const fn new(
        id: ChannelId,
        delivery: DeliveryMethod,
        label: Cow<'static, str>,
        priority: u8,
    ) -> Self {
        Self {
            id,
            delivery,
            label,
            priority,
        }
    }
}

/// Registry of all known channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelRegistry {
    by_id: HashMap<ChannelId, ChannelDescriptor>,
}

impl ChannelRegistry {
    pub fn new(channels: impl IntoIterator<Item = ChannelDescriptor>) -> Self {
        let mut by_id = HashMap::new();
        for descriptor in channels {
            by_id.insert(descriptor.id, descriptor);
        }
        Self { by_id }
    }

    pub fn descriptor(&self, id: ChannelId) -> Option<&ChannelDescriptor> {
        self.by_id.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelDescriptor> {
        self.by_id.values()
    }
}

/// The channel set every orbitlink connection opens.
pub fn default_channels() -> ChannelRegistry {
    ChannelRegistry::new([
        ChannelDescriptor::new(
            CHANNEL_CONTROL,
            DeliveryMethod::ReliableOrdered,
            "control".into(),
            10,
        ),
        ChannelDescriptor::new(
            CHANNEL_STATUS,
            DeliveryMethod::ReliableUnordered,
            "status".into(),
            5,
        ),
        ChannelDescriptor::new(
            CHANNEL_POSITION,
            DeliveryMethod::UnreliableSequenced,
            "position".into(),
            1,
        ),
    ])
}
