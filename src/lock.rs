// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The lock manager: enforces the at-most-one-writer rule across the
//! registry and the live session set.
//!
//! The registry row is the canonical lock token; this layer adds the
//! session-facing protocol on top (deny/hand-off for client locks, seizure
//! notifications for server locks). It talks to the session layer only
//! through the narrow [`SessionNotifier`] interface so neither side holds
//! the other's concrete type.

use std::sync::Arc;

use base::clock::Clocks;
use base::{bail, Error};
use db::auth::Identity;
use db::registry::{DatabaseName, DatabaseState, LockType, Registry};
use db::workingcopy::WorkingCopies;
use tracing::info;
use uuid::Uuid;

/// Observer interface implemented by the session layer.
pub trait SessionNotifier: Send + Sync + 'static {
    /// A newer session for the same user superseded `connection_id`.
    fn notify_session_transferred(&self, connection_id: &str);

    /// The lock on `(video, db)` changed type; bound sessions must stop
    /// accepting mutations until they re-acquire.
    fn notify_lock_changed(
        &self,
        video_id: &str,
        database_name: DatabaseName,
        lock_type: LockType,
        reason: &str,
    );
}

/// Outcome of a client-lock request.
pub enum ClientLockOutcome {
    Granted {
        state: DatabaseState,
        connection_id: String,
        needs_download: bool,
    },
    Denied {
        reason: &'static str,
        lock_holder_user_id: Option<String>,
    },
}

pub struct LockManager<C: Clocks + Clone> {
    registry: Arc<Registry<C>>,
    copies: Arc<WorkingCopies<C>>,
    notifier: Arc<dyn SessionNotifier>,
}

impl<C: Clocks + Clone> LockManager<C> {
    pub fn new(
        registry: Arc<Registry<C>>,
        copies: Arc<WorkingCopies<C>>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        LockManager {
            registry,
            copies,
            notifier,
        }
    }

    /// Client-lock acquisition. Denies if a workflow holds the lock or a
    /// different user does; otherwise grants, superseding the caller's own
    /// previous session if one is bound (hand-off). The superseded session
    /// is notified before the new connection id becomes usable.
    pub fn acquire_client(
        &self,
        video_id: &str,
        database_name: DatabaseName,
        identity: &Identity,
    ) -> Result<ClientLockOutcome, Error> {
        let mut l = self.registry.lock();
        let state = l.get_or_create_state(video_id, database_name, &identity.tenant_id)?;
        match state.lock_type {
            LockType::Server => Ok(ClientLockOutcome::Denied {
                reason: "workflow_running",
                lock_holder_user_id: None,
            }),
            LockType::Client
                if state.lock_holder_user_id.as_deref() != Some(identity.user_id.as_str()) =>
            {
                Ok(ClientLockOutcome::Denied {
                    reason: "locked_by_other_user",
                    lock_holder_user_id: state.lock_holder_user_id,
                })
            }
            _ => {
                let connection_id = Uuid::new_v4().to_string();
                if let Some(prev) = &state.active_connection_id {
                    self.notifier.notify_session_transferred(prev);
                }
                let state = l.acquire_client_lock(
                    video_id,
                    database_name,
                    &identity.user_id,
                    &connection_id,
                    &identity.tenant_id,
                )?;
                let needs_download =
                    !self
                        .copies
                        .has_working_copy(&identity.tenant_id, video_id, database_name);
                info!(
                    "granted client lock on {video_id}/{database_name} to {} ({connection_id})",
                    identity.user_id
                );
                Ok(ClientLockOutcome::Granted {
                    state,
                    connection_id,
                    needs_download,
                })
            }
        }
    }

    /// Voluntary release; succeeds only if the caller holds the lock.
    pub fn release_client(
        &self,
        video_id: &str,
        database_name: DatabaseName,
        identity: &Identity,
    ) -> Result<bool, Error> {
        let released = {
            let mut l = self.registry.lock();
            match l.get_state(video_id, database_name)? {
                Some(s)
                    if s.lock_type == LockType::Client
                        && s.lock_holder_user_id.as_deref()
                            == Some(identity.user_id.as_str()) =>
                {
                    l.release_lock(video_id, database_name)?;
                    true
                }
                _ => false,
            }
        };
        if released {
            self.notifier.notify_lock_changed(
                video_id,
                database_name,
                LockType::None,
                "released",
            );
        }
        Ok(released)
    }

    /// Workflow entry point: takes the server lock or fails immediately
    /// with lock contention. Bound sessions are told to stop mutating.
    ///
    /// A workflow started by the user who currently holds the client lock
    /// displaces that user's own session: approving a layout is the natural
    /// end of editing it, so their lock converts rather than contending.
    pub fn acquire_server(
        &self,
        video_id: &str,
        database_name: DatabaseName,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), Error> {
        let acquired = {
            let mut l = self.registry.lock();
            let state = l.get_or_create_state(video_id, database_name, tenant_id)?;
            if let (LockType::Client, Some(user)) = (state.lock_type, user_id) {
                if state.lock_holder_user_id.as_deref() == Some(user) {
                    l.release_lock(video_id, database_name)?;
                }
            }
            l.acquire_server_lock(video_id, database_name, user_id)?
        };
        if !acquired {
            bail!(
                FailedPrecondition,
                msg("lock on {video_id}/{database_name} is held; workflow can't start")
            );
        }
        info!("took server lock on {video_id}/{database_name}");
        self.notifier.notify_lock_changed(
            video_id,
            database_name,
            LockType::Server,
            "workflow_running",
        );
        Ok(())
    }

    /// Releases the server lock (workflow completion, success or failure);
    /// waiting clients may retry acquisition afterward.
    pub fn release_server(
        &self,
        video_id: &str,
        database_name: DatabaseName,
    ) -> Result<(), Error> {
        self.registry.lock().release_lock(video_id, database_name)?;
        info!("released server lock on {video_id}/{database_name}");
        self.notifier.notify_lock_changed(
            video_id,
            database_name,
            LockType::None,
            "workflow_finished",
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry<C>> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::testutil::TestHarness;

    #[derive(Default)]
    struct RecordingNotifier {
        transferred: base::Mutex<Vec<String>>,
        lock_changes: base::Mutex<Vec<(String, LockType, String)>>,
    }

    impl SessionNotifier for RecordingNotifier {
        fn notify_session_transferred(&self, connection_id: &str) {
            self.transferred.lock().push(connection_id.to_owned());
        }
        fn notify_lock_changed(
            &self,
            video_id: &str,
            _database_name: DatabaseName,
            lock_type: LockType,
            reason: &str,
        ) {
            self.lock_changes
                .lock()
                .push((video_id.to_owned(), lock_type, reason.to_owned()));
        }
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_owned(),
            tenant_id: "t1".to_owned(),
        }
    }

    async fn manager(
        h: &TestHarness,
    ) -> (
        LockManager<base::clock::SimulatedClocks>,
        Arc<RecordingNotifier>,
    ) {
        let notifier = Arc::new(RecordingNotifier::default());
        (
            LockManager::new(h.registry.clone(), h.copies.clone(), notifier.clone()),
            notifier,
        )
    }

    #[tokio::test]
    async fn grant_then_deny_other_user() {
        let h = TestHarness::new().await;
        let (m, _n) = manager(&h).await;
        let out = m
            .acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();
        let ClientLockOutcome::Granted { needs_download, .. } = out else {
            panic!("expected grant");
        };
        assert!(needs_download);

        let out = m
            .acquire_client("v1", DatabaseName::Layout, &identity("bob"))
            .unwrap();
        let ClientLockOutcome::Denied {
            lock_holder_user_id,
            ..
        } = out
        else {
            panic!("expected denial");
        };
        assert_eq!(lock_holder_user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn same_user_handoff_notifies_old_session() {
        let h = TestHarness::new().await;
        let (m, n) = manager(&h).await;
        let ClientLockOutcome::Granted {
            connection_id: c1, ..
        } = m
            .acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap()
        else {
            panic!("expected grant");
        };
        let ClientLockOutcome::Granted {
            connection_id: c2,
            state,
            ..
        } = m
            .acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap()
        else {
            panic!("expected grant");
        };
        assert_ne!(c1, c2);
        assert_eq!(state.active_connection_id.as_deref(), Some(c2.as_str()));
        assert_eq!(n.transferred.lock().as_slice(), &[c1]);
    }

    #[tokio::test]
    async fn server_lock_contention_and_seizure() {
        let h = TestHarness::new().await;
        let (m, n) = manager(&h).await;
        m.acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();

        // Can't start a workflow while a client holds the lock.
        let e = m
            .acquire_server("v1", DatabaseName::Layout, "t1", None)
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);

        m.release_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();
        m.acquire_server("v1", DatabaseName::Layout, "t1", Some("alice"))
            .unwrap();
        assert!(n
            .lock_changes
            .lock()
            .iter()
            .any(|(_, t, r)| *t == LockType::Server && r == "workflow_running"));

        // Client acquisition is refused while the workflow runs.
        let out = m
            .acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();
        assert!(matches!(
            out,
            ClientLockOutcome::Denied {
                reason: "workflow_running",
                ..
            }
        ));

        m.release_server("v1", DatabaseName::Layout).unwrap();
        let out = m
            .acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();
        assert!(matches!(out, ClientLockOutcome::Granted { .. }));
    }

    #[tokio::test]
    async fn own_workflow_displaces_client_session() {
        let h = TestHarness::new().await;
        let (m, n) = manager(&h).await;
        let ClientLockOutcome::Granted { connection_id, .. } = m
            .acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap()
        else {
            panic!("expected grant");
        };

        // Alice approving her own layout converts her client lock.
        m.acquire_server("v1", DatabaseName::Layout, "t1", Some("alice"))
            .unwrap();
        let s = h
            .registry
            .lock()
            .get_state("v1", DatabaseName::Layout)
            .unwrap()
            .unwrap();
        assert_eq!(s.lock_type, LockType::Server);
        assert_ne!(s.active_connection_id.as_deref(), Some(connection_id.as_str()));
        assert!(n
            .lock_changes
            .lock()
            .iter()
            .any(|(_, t, _)| *t == LockType::Server));

        // A different user's workflow still contends.
        m.release_server("v1", DatabaseName::Layout).unwrap();
        m.acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();
        let e = m
            .acquire_server("v1", DatabaseName::Layout, "t1", Some("bob"))
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn release_requires_holder() {
        let h = TestHarness::new().await;
        let (m, _n) = manager(&h).await;
        m.acquire_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap();
        assert!(!m
            .release_client("v1", DatabaseName::Layout, &identity("bob"))
            .unwrap());
        assert!(m
            .release_client("v1", DatabaseName::Layout, &identity("alice"))
            .unwrap());
    }
}
