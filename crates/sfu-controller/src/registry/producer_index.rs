//! Per-room reverse index from stream id to its publisher.

use super::participant::StreamKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedStream {
    pub uid: String,
    pub kind: StreamKind,
}

/// A stream as advertised to other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_id: String,
    pub uid: String,
    pub kind: StreamKind,
}

/// Written only together with the owning participant's producer slot.
#[derive(Debug, Default)]
pub struct ProducerIndex {
    entries: HashMap<String, IndexedStream>,
}

impl ProducerIndex {
    pub(super) fn insert(&mut self, stream_id: &str, uid: &str, kind: StreamKind) {
        self.entries.insert(
            stream_id.to_string(),
            IndexedStream {
                uid: uid.to_string(),
                kind,
            },
        );
    }

    pub(super) fn remove(&mut self, stream_id: &str) -> Option<IndexedStream> {
        self.entries.remove(stream_id)
    }

    pub fn get(&self, stream_id: &str) -> Option<&IndexedStream> {
        self.entries.get(stream_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Streams published by anyone other than `exclude_uid`, sorted by id.
    pub fn streams(&self, exclude_uid: Option<&str>) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .entries
            .iter()
            .filter(|(_, entry)| Some(entry.uid.as_str()) != exclude_uid)
            .map(|(stream_id, entry)| StreamInfo {
                stream_id: stream_id.clone(),
                uid: entry.uid.clone(),
                kind: entry.kind,
            })
            .collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }
}
