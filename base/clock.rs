// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Clock interface and implementations for testability.
//!
//! Production code uses [`RealClocks`]; tests use [`SimulatedClocks`] so that
//! idle/checkpoint threshold logic can be exercised without real sleeps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tracing::warn;

use crate::shutdown::{Receiver, ShutdownError};
use crate::Error;
use crate::Mutex;

/// Abstract interface to the system clocks.
pub trait Clocks: Clone + Send + Sync + 'static {
    /// Gets the current wall time.
    fn realtime(&self) -> Timestamp;

    /// Sleeps for the specified time (or simulates doing so).
    fn sleep(&self, how_long: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Copy, Clone)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        Timestamp::now()
    }

    async fn sleep(&self, how_long: Duration) {
        tokio::time::sleep(how_long).await
    }
}

/// Simulated clock for testing; `sleep` advances the clock instantly.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<Timestamp>>);

impl SimulatedClocks {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(start)))
    }

    /// Advances the clock by `how_long` without a `sleep` call.
    pub fn advance(&self, how_long: Duration) {
        let mut l = self.0.lock();
        *l = l.checked_add(how_long).expect("simulated time overflow");
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        *self.0.lock()
    }

    async fn sleep(&self, how_long: Duration) {
        self.advance(how_long);
        // Let other tasks make progress, as a real sleep would.
        tokio::task::yield_now().await;
    }
}

/// Bounded exponential backoff for retry loops against flaky I/O.
///
/// Each [`Backoff::wait`] logs the error, honors shutdown, sleeps, and
/// doubles the delay up to the maximum.
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff { next: initial, max }
    }

    pub async fn wait<C: Clocks>(
        &mut self,
        clocks: &C,
        shutdown_rx: &Receiver,
        err: &Error,
    ) -> Result<(), ShutdownError> {
        shutdown_rx.check()?;
        warn!(err = %err.chain(), "sleeping for {:?} after error", self.next);
        clocks.sleep(self.next).await;
        shutdown_rx.check()?;
        self.next = std::cmp::min(self.next * 2, self.max);
        Ok(())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
