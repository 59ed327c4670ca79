//! Single-shot cleanup timers.
//!
//! A [`Liveness`] holds at most one armed timer. Re-arming cancels the
//! previous one and takes a new generation; the expiry callback receives
//! the generation it was armed with so that a late firing can detect that
//! it was superseded. Generations are unique process-wide, so a callback
//! can never match a timer of a later participant with the same uid.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub struct Liveness {
    generation: u64,
    armed: Option<CancellationToken>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that runs `on_expiry(generation)` after `after`, replacing
    /// any timer already armed. Returns the new generation.
    pub fn arm<F, Fut>(&mut self, after: Duration, on_expiry: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        self.generation = generation;
        let token = CancellationToken::new();
        self.armed = Some(token.clone());

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => on_expiry(generation).await,
            }
        });
        generation
    }

    /// Cancel the armed timer, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }

    /// Mark the timer as fired so that it no longer counts as armed.
    pub fn disarm_if(&mut self, generation: u64) -> bool {
        if self.generation == generation && self.armed.is_some() {
            self.armed = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.cancel();
    }
}
