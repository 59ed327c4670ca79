//! Participant session state machine.
//!
//! ```text
//!  Absent      ── Announce ─────────────────────▶ Announced
//!  Absent      ── Join ─────────────────────────▶ Active
//!  Announced   ── Join, Reconnect ──────────────▶ Active
//!  Announced   ── Announce, Heartbeat, Disconnect ▶ Announced
//!  Active      ── Announce, Heartbeat, Join, Reconnect ▶ Active
//!  Active      ── Disconnect ───────────────────▶ GracePeriod
//!  GracePeriod ── Announce, Disconnect ─────────▶ GracePeriod
//!  GracePeriod ── Heartbeat, Join, Reconnect ───▶ Active
//!  Active      ── HeartbeatTimeout ─────────────▶ Removed
//!  Announced,
//!  GracePeriod ── GraceExpired ─────────────────▶ Removed
//!  any live    ── Leave ────────────────────────▶ Removed
//! ```
//!
//! `Removed` is terminal. Media operations are allowed in `Active` only. A
//! participant that never joined stays `Announced` across a socket drop, so
//! only join or reconnect can activate it.

use crate::errors::SfuError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Absent,
    Announced,
    Active,
    GracePeriod,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    Announce,
    Join,
    Reconnect,
    Heartbeat,
    Disconnect,
    HeartbeatTimeout,
    GraceExpired,
    Leave,
    /// Guard for media operations; legal only while `Active`.
    Media,
}

impl SessionState {
    /// The state after `event`, or `IllegalTransition`.
    pub fn apply(self, event: SessionEvent) -> Result<SessionState, SfuError> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (S::Absent, E::Announce) => S::Announced,
            (S::Absent, E::Join) => S::Active,

            (S::Announced | S::Active | S::GracePeriod, E::Announce) => self,

            (S::Announced | S::Active | S::GracePeriod, E::Join | E::Reconnect) => S::Active,

            (S::Active, E::Media) => S::Active,

            (S::Active | S::GracePeriod, E::Heartbeat) => S::Active,
            (S::Announced, E::Heartbeat) => S::Announced,

            (S::Active | S::GracePeriod, E::Disconnect) => S::GracePeriod,
            (S::Announced, E::Disconnect) => S::Announced,

            (S::Active, E::HeartbeatTimeout) => S::Removed,
            (S::Announced | S::GracePeriod, E::GraceExpired) => S::Removed,
            (S::Announced | S::Active | S::GracePeriod, E::Leave) => S::Removed,

            (from, event) => return Err(SfuError::IllegalTransition { from, event }),
        };
        Ok(next)
    }

    pub fn allows_media(self) -> bool {
        self.apply(SessionEvent::Media).is_ok()
    }

    /// Whether the participant is still tracked by the registry.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Absent | SessionState::Removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use SessionEvent as E;
    use SessionState as S;

    const ALL_EVENTS: [SessionEvent; 9] = [
        E::Announce,
        E::Join,
        E::Reconnect,
        E::Heartbeat,
        E::Disconnect,
        E::HeartbeatTimeout,
        E::GraceExpired,
        E::Leave,
        E::Media,
    ];

    #[test]
    fn test_happy_path() {
        let state = S::Absent.apply(E::Announce).unwrap();
        assert_eq!(state, S::Announced);
        let state = state.apply(E::Join).unwrap();
        assert_eq!(state, S::Active);
        let state = state.apply(E::Disconnect).unwrap();
        assert_eq!(state, S::GracePeriod);
        assert_eq!(state.apply(E::Reconnect).unwrap(), S::Active);
        assert_eq!(state.apply(E::GraceExpired).unwrap(), S::Removed);
    }

    #[test]
    fn test_heartbeat_restores_active_from_grace() {
        assert_eq!(S::GracePeriod.apply(E::Heartbeat).unwrap(), S::Active);
        assert_eq!(S::Active.apply(E::Heartbeat).unwrap(), S::Active);
        assert_eq!(S::Announced.apply(E::Heartbeat).unwrap(), S::Announced);
    }

    #[test]
    fn test_removed_is_terminal() {
        for event in ALL_EVENTS {
            assert!(S::Removed.apply(event).is_err(), "{event:?}");
        }
    }

    #[test]
    fn test_absent_accepts_only_announce_and_join() {
        for event in ALL_EVENTS {
            let result = S::Absent.apply(event);
            let legal = matches!(event, E::Announce | E::Join);
            assert_eq!(result.is_ok(), legal, "{event:?}");
        }
    }

    #[test]
    fn test_cleanup_timer_expiry_removes() {
        assert_eq!(S::Active.apply(E::HeartbeatTimeout).unwrap(), S::Removed);
        assert_eq!(S::GracePeriod.apply(E::GraceExpired).unwrap(), S::Removed);
        assert_eq!(S::Announced.apply(E::GraceExpired).unwrap(), S::Removed);
        assert!(S::Active.apply(E::GraceExpired).is_err());
        assert!(S::GracePeriod.apply(E::HeartbeatTimeout).is_err());
        assert!(S::Announced.apply(E::HeartbeatTimeout).is_err());
    }

    #[test]
    fn test_announced_never_activates_without_join() {
        let dropped = S::Announced.apply(E::Disconnect).unwrap();
        assert_eq!(dropped, S::Announced);
        assert_eq!(dropped.apply(E::Heartbeat).unwrap(), S::Announced);
        assert_eq!(dropped.apply(E::Announce).unwrap(), S::Announced);
        assert_eq!(dropped.apply(E::Join).unwrap(), S::Active);
    }

    #[test]
    fn test_leave_from_every_live_state() {
        for state in [S::Announced, S::Active, S::GracePeriod] {
            assert_eq!(state.apply(E::Leave).unwrap(), S::Removed);
        }
    }

    #[test]
    fn test_media_requires_active() {
        assert!(S::Active.allows_media());
        assert!(!S::Announced.allows_media());
        assert!(!S::GracePeriod.allows_media());
    }

    #[test]
    fn test_illegal_transition_error() {
        let err = S::Removed.apply(E::Heartbeat).unwrap_err();
        assert_eq!(err.error_code(), 5);
        assert_eq!(err.to_string(), "Illegal transition: Heartbeat while Removed");
    }
}
