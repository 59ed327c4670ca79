use super::participant::Participant;
use super::producer_index::ProducerIndex;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A room's membership and published streams. The router is tracked by
/// the router directory, not here.
#[derive(Debug)]
pub struct Room {
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    pub(super) participants: HashMap<String, Participant>,
    pub(super) producer_index: ProducerIndex,
}

impl Room {
    pub(super) fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            created_at: Utc::now(),
            participants: HashMap::new(),
            producer_index: ProducerIndex::default(),
        }
    }

    pub fn producer_index(&self) -> &ProducerIndex {
        &self.producer_index
    }

    /// Number of producer slots held by members. Always equal to the index
    /// size.
    pub fn open_producer_count(&self) -> usize {
        self.participants
            .values()
            .map(|p| p.producers().len())
            .sum()
    }
}
