// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Dropping the [`Sender`] requests shutdown. Receivers can be cloned,
//! polled cheaply via [`Receiver::check`], or awaited as a future.

use std::future::Future;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

/// Shutdown requester; dropping it signals every [`Receiver`].
pub struct Sender(#[allow(dead_code)] tokio::sync::watch::Sender<()>);

#[derive(Clone)]
pub struct Receiver(tokio::sync::watch::Receiver<()>);

impl Receiver {
    /// Returns `Err(ShutdownError)` iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        // `has_changed` errors exactly when the sender is gone.
        match self.0.has_changed() {
            Ok(_) => Ok(()),
            Err(_) => Err(ShutdownError),
        }
    }

    /// Returns a future which resolves when shutdown is requested.
    ///
    /// The future owns a fresh watch handle, so it can be stored in a
    /// `select!` without borrowing `self`.
    pub fn future(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.0.clone();
        async move {
            // The sender never sends; `changed` errors on drop.
            while rx.changed().await.is_ok() {}
        }
    }

    /// Waits for shutdown.
    pub async fn wait(&mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

/// Returns a sender and receiver for graceful shutdown.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = tokio::sync::watch::channel(());
    (Sender(tx), Receiver(rx))
}

#[cfg(test)]
mod tests {
    #[test]
    fn check_before_and_after() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[tokio::test]
    async fn future_resolves_on_drop() {
        let (tx, rx) = super::channel();
        let f = rx.future();
        drop(tx);
        f.await;
    }

    #[tokio::test]
    async fn clones_all_signalled() {
        let (tx, rx) = super::channel();
        let rx2 = rx.clone();
        drop(tx);
        rx.future().await;
        rx2.check().unwrap_err();
    }
}
