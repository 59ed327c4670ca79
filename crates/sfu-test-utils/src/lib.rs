//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU controller.
//!
//! - `harness` - In-process controller on the loopback engine, plus a
//!   client stand-in that talks to the session handler directly
//! - `fixtures` - Capabilities, RTP/DTLS parameters and participants
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::start().await;
//!     let mut alice = harness.ready("alice", "room-1").await;
//!     let stream_id = alice.produce(StreamKind::Audio).await;
//!
//!     let mut bob = harness.ready("bob", "room-1").await;
//!     bob.consume_now(&stream_id).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::{TestClient, TestHarness, TestHarnessBuilder};
