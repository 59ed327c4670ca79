//! Outbound event fan-out to client connections.

use super::messages::ServerEvent;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sending half of one connection's outbound queue.
pub type ConnectionSender = mpsc::Sender<ServerEvent>;

/// Registry of live connections keyed by connection id.
///
/// Sends never block: a full queue drops the event with a warning, and a
/// closed queue is logged and ignored since its socket is already gone.
#[derive(Default)]
pub struct ConnectionHub {
    connections: Mutex<HashMap<String, ConnectionSender>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, ConnectionSender>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, connection_id: &str, sender: ConnectionSender) {
        self.connections()
            .insert(connection_id.to_string(), sender);
    }

    pub fn unregister(&self, connection_id: &str) {
        self.connections().remove(connection_id);
    }

    pub fn send(&self, connection_id: &str, event: ServerEvent) {
        let Some(sender) = self.connections().get(connection_id).cloned() else {
            debug!(target: "sfu.signaling", connection_id, "Dropping event for unknown connection");
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "sfu.signaling", connection_id, "Outbound queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: "sfu.signaling", connection_id, "Outbound queue closed");
            }
        }
    }

    pub fn broadcast(&self, connection_ids: &[String], event: &ServerEvent) {
        for connection_id in connection_ids {
            self.send(connection_id, event.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections().is_empty()
    }
}
