// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The checkpointer: a background loop that flushes unsaved working copies
//! to the object store.
//!
//! Each tick scans the registry for dirty databases past the idle or
//! hard-checkpoint threshold, then flushes each under a freshly acquired
//! server lock (skipping any database a client or workflow currently
//! holds). Failures release the lock and wait for the next tick; shutdown
//! triggers one final synchronous sweep of everything unsaved.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown;
use base::Error;
use futures::StreamExt as _;
use tracing::{debug, info, info_span, warn, Instrument as _};

use crate::registry::{DatabaseState, Registry};
use crate::workingcopy::WorkingCopies;

#[derive(Clone, Debug)]
pub struct CheckpointerOptions {
    /// Scan period.
    pub period: Duration,
    /// Flush databases with no accepted message for this long.
    pub idle: Duration,
    /// Flush databases whose last durable sync is older than this, even
    /// while active.
    pub checkpoint: Duration,
    /// Absolute server-lock hold limit; stale locks past this are broken.
    pub max_server_lock_hold: Duration,
    /// Bound on concurrent flushes per tick.
    pub max_parallel: usize,
}

impl Default for CheckpointerOptions {
    fn default() -> Self {
        CheckpointerOptions {
            period: Duration::from_secs(30),
            idle: Duration::from_secs(5 * 60),
            checkpoint: Duration::from_secs(15 * 60),
            max_server_lock_hold: Duration::from_secs(60 * 60),
            max_parallel: 4,
        }
    }
}

enum Command {
    /// See [`CheckpointerChannel::flush`].
    Flush(tokio::sync::oneshot::Sender<Infallible>),
}

/// A channel which can be used to prod the checkpointer. Can be cloned.
#[derive(Clone)]
pub struct CheckpointerChannel(tokio::sync::mpsc::Sender<Command>);

impl CheckpointerChannel {
    /// Runs a scan immediately and waits for it to complete, including its
    /// flushes. Used by tests and the final pre-shutdown sweep trigger.
    pub async fn flush(&self) {
        let (snd, rcv) = tokio::sync::oneshot::channel();
        if self.0.send(Command::Flush(snd)).await.is_err() {
            return; // checkpointer already gone.
        }
        let _ = rcv.await; // sender is dropped when the scan finishes.
    }
}

struct Checkpointer<C: Clocks + Clone> {
    registry: Arc<Registry<C>>,
    copies: Arc<WorkingCopies<C>>,
    options: CheckpointerOptions,
}

/// Starts the checkpointer task. Returns a channel for manual flushes and
/// the join handle; the task exits (after a final sweep) when shutdown is
/// signalled or all channel clones are dropped.
pub fn start_checkpointer<C: Clocks + Clone>(
    registry: Arc<Registry<C>>,
    copies: Arc<WorkingCopies<C>>,
    shutdown_rx: shutdown::Receiver,
    options: CheckpointerOptions,
) -> (CheckpointerChannel, tokio::task::JoinHandle<()>) {
    let (snd, mut rcv) = tokio::sync::mpsc::channel(16);
    let checkpointer = Checkpointer {
        registry,
        copies,
        options,
    };
    let span = info_span!("checkpointer");
    let join = tokio::spawn(
        async move {
            info!("starting");
            let clocks = checkpointer.registry.clocks();
            loop {
                tokio::select! {
                    biased;

                    cmd = rcv.recv() => match cmd {
                        Some(Command::Flush(done)) => {
                            checkpointer.scan().await;
                            drop(done);
                        }
                        None => break,
                    },

                    _ = shutdown_rx.future() => break,

                    _ = clocks.sleep(checkpointer.options.period) => {
                        checkpointer.expire_stale_locks();
                        checkpointer.scan().await;
                    }
                }
            }
            checkpointer.final_sweep().await;
            info!("ending");
        }
        .instrument(span),
    );
    (CheckpointerChannel(snd), join)
}

impl<C: Clocks + Clone> Checkpointer<C> {
    fn expire_stale_locks(&self) {
        let stale = match self
            .registry
            .lock()
            .expire_stale_server_locks(self.options.max_server_lock_hold)
        {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e.chain(), "unable to expire stale server locks");
                return;
            }
        };
        for s in stale {
            warn!(
                "broke server lock on {}/{} held since {:?}",
                s.video_id, s.database_name, s.locked_at
            );
        }
    }

    /// One scan: flush every pending database, bounded-parallel.
    async fn scan(&self) {
        let dirty = match self
            .registry
            .lock()
            .list_pending_uploads(self.options.idle, self.options.checkpoint)
        {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e.chain(), "unable to scan for pending uploads");
                return;
            }
        };
        if dirty.is_empty() {
            return;
        }
        debug!("{} database(s) pending upload", dirty.len());
        futures::stream::iter(dirty)
            .for_each_concurrent(self.options.max_parallel, |state| self.flush_one(state))
            .await;
    }

    /// Flushes everything unsaved, regardless of thresholds. Run once at
    /// shutdown.
    async fn final_sweep(&self) {
        let unsaved = match self.registry.lock().list_unsaved() {
            Ok(u) => u,
            Err(e) => {
                warn!(err = %e.chain(), "unable to scan for unsaved state at shutdown");
                return;
            }
        };
        if unsaved.is_empty() {
            return;
        }
        info!("final sweep: {} database(s) unsaved", unsaved.len());
        futures::stream::iter(unsaved)
            .for_each_concurrent(self.options.max_parallel, |state| self.flush_one(state))
            .await;
    }

    async fn flush_one(&self, state: DatabaseState) {
        let (video_id, db) = (state.video_id.clone(), state.database_name);
        let acquired = match self.registry.lock().acquire_server_lock(&video_id, db, None) {
            Ok(a) => a,
            Err(e) => {
                warn!(err = %e.chain(), "unable to acquire server lock for {video_id}/{db}");
                return;
            }
        };
        if !acquired {
            // A client session or workflow is active; try again next tick.
            debug!("skipping {video_id}/{db}: locked");
            return;
        }
        let result = self.flush_locked(&state).await;
        if let Err(e) = self.registry.lock().release_lock(&video_id, db) {
            warn!(err = %e.chain(), "unable to release server lock for {video_id}/{db}");
        }
        match result {
            Ok(version) => info!("flushed {video_id}/{db} at version {version}"),
            Err(e) => {
                warn!(err = %e.chain(), "flush of {video_id}/{db} failed; will retry next tick")
            }
        }
    }

    /// The actual flush, run while holding the server lock.
    async fn flush_locked(&self, state: &DatabaseState) -> Result<u64, Error> {
        let snapshot = self
            .copies
            .upload_to_store(&state.tenant_id, &state.video_id, state.database_name)
            .await?;
        let now = self.registry.clocks().realtime();
        self.registry.lock().advance_wasabi_version(
            &state.video_id,
            state.database_name,
            snapshot,
            now,
        )?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DatabaseName, LockType};
    use crate::testutil::TestHarness;
    use crate::workingcopy::RowDelta;
    use serde_json::Value;

    fn delta(seq: i64) -> RowDelta {
        RowDelta {
            table: "captions".to_owned(),
            primary_key: Value::from(1),
            column_id: "text".to_owned(),
            value: Value::from("x"),
            column_version: seq,
            db_version: seq,
            site_id: "site-a".to_owned(),
            causal_length: 1,
            sequence: 1,
        }
    }

    #[tokio::test]
    async fn flush_advances_wasabi_version() {
        let h = TestHarness::new().await;
        h.copies
            .apply_changes("t1", "v1", DatabaseName::Captions, &[delta(1)])
            .await
            .unwrap();
        h.clocks.advance(Duration::from_secs(10 * 60));

        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let (channel, join) = start_checkpointer(
            h.registry.clone(),
            h.copies.clone(),
            shutdown_rx,
            CheckpointerOptions::default(),
        );
        channel.flush().await;

        let s = h
            .registry
            .lock()
            .get_state("v1", DatabaseName::Captions)
            .unwrap()
            .unwrap();
        assert_eq!(s.wasabi_version, 1);
        assert_eq!(s.lock_type, LockType::None);
        assert!(s.wasabi_synced_at.is_some());

        drop(shutdown_tx);
        drop(channel);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn locked_database_is_skipped() {
        let h = TestHarness::new().await;
        h.copies
            .apply_changes("t1", "v1", DatabaseName::Captions, &[delta(1)])
            .await
            .unwrap();
        h.registry
            .lock()
            .acquire_client_lock("v1", DatabaseName::Captions, "alice", "c1", "t1")
            .unwrap();
        h.clocks.advance(Duration::from_secs(30 * 60));

        let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let (channel, _join) = start_checkpointer(
            h.registry.clone(),
            h.copies.clone(),
            shutdown_rx,
            CheckpointerOptions::default(),
        );
        channel.flush().await;

        let s = h
            .registry
            .lock()
            .get_state("v1", DatabaseName::Captions)
            .unwrap()
            .unwrap();
        // Untouched: still dirty and still client-locked.
        assert_eq!(s.wasabi_version, 0);
        assert_eq!(s.lock_type, LockType::Client);
    }

    #[tokio::test]
    async fn shutdown_runs_final_sweep() {
        let h = TestHarness::new().await;
        h.copies
            .apply_changes("t1", "v1", DatabaseName::Captions, &[delta(1)])
            .await
            .unwrap();
        // Fresh edit, no thresholds crossed; only the final sweep flushes it.
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let (channel, join) = start_checkpointer(
            h.registry.clone(),
            h.copies.clone(),
            shutdown_rx,
            CheckpointerOptions::default(),
        );
        drop(shutdown_tx);
        drop(channel);
        join.await.unwrap();

        let s = h
            .registry
            .lock()
            .get_state("v1", DatabaseName::Captions)
            .unwrap()
            .unwrap();
        assert_eq!(s.wasabi_version, 1);
    }
}
