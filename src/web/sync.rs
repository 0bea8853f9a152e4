// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Lock lifecycle REST endpoints and the sync websocket entry point.

use std::sync::Arc;

use base::clock::Clocks;
use base::{bail, Error, ErrorKind};
use db::registry::{DatabaseName, DatabaseState, LockType};
use http::Request;
use hyper::Body;

use super::{serve_json, websocket, Caller, ResponseResult, Service};
use crate::json;
use crate::lock::ClientLockOutcome;
use crate::session::{run_session, SessionBind};

impl<C: Clocks + Clone> Service<C> {
    pub(super) fn get_database_state(
        &self,
        caller: &Caller,
        video_id: &str,
        db: DatabaseName,
    ) -> ResponseResult {
        self.video_for_caller(video_id, caller)?;
        let state = self.registry.lock().get_state(video_id, db)?;
        let state = state.unwrap_or_else(|| {
            DatabaseState::absent(video_id, db, &caller.identity.tenant_id)
        });
        serve_json(&json::DatabaseStateView::from_state(
            &state,
            &caller.identity.user_id,
        ))
    }

    pub(super) fn acquire_lock(
        &self,
        caller: &Caller,
        video_id: &str,
        db: DatabaseName,
    ) -> ResponseResult {
        self.video_for_caller(video_id, caller)?;
        match self.locks.acquire_client(video_id, db, &caller.identity)? {
            ClientLockOutcome::Granted {
                state,
                connection_id,
                needs_download,
            } => serve_json(&json::LockResponse {
                granted: true,
                websocket_url: Some(format!(
                    "/videos/{video_id}/sync/{db}?connectionId={connection_id}"
                )),
                server_version: Some(state.server_version),
                wasabi_version: Some(state.wasabi_version),
                needs_download: Some(needs_download),
                ..Default::default()
            }),
            ClientLockOutcome::Denied {
                reason,
                lock_holder_user_id,
            } => serve_json(&json::LockResponse {
                granted: false,
                reason: Some(reason.to_owned()),
                lock_holder_user_id,
                ..Default::default()
            }),
        }
    }

    pub(super) fn release_lock(
        &self,
        caller: &Caller,
        video_id: &str,
        db: DatabaseName,
    ) -> ResponseResult {
        self.video_for_caller(video_id, caller)?;
        let released = self.locks.release_client(video_id, db, &caller.identity)?;
        serve_json(&json::ReleaseResponse { released })
    }

    pub(super) fn ensure_state(
        &self,
        caller: &Caller,
        video_id: &str,
        db: DatabaseName,
    ) -> ResponseResult {
        self.video_for_caller(video_id, caller)?;
        let state =
            self.registry
                .lock()
                .get_or_create_state(video_id, db, &caller.identity.tenant_id)?;
        serve_json(&json::DatabaseStateView::from_state(
            &state,
            &caller.identity.user_id,
        ))
    }

    /// Upgrades to the sync websocket. The caller's token was already
    /// verified (via the `token` query parameter); binding to the lock is
    /// validated inside the upgraded stream so failures reach the client as
    /// an `error` frame.
    pub(super) fn sync_socket(
        self: Arc<Self>,
        req: Request<Body>,
        caller: Caller,
        video_id: String,
        db: DatabaseName,
    ) -> ResponseResult {
        let connection_id = Self::query_param(&req, "connectionId");
        let ctx = self.session_context();
        let this = self;
        websocket::upgrade(req, move |ws| {
            Box::pin(async move {
                let bind = this
                    .bind_session(caller, connection_id, &video_id, db)
                    .await?;
                run_session(ctx, ws, bind).await
            })
        })
    }

    /// Verifies that this socket's connection id is the one the registry
    /// has bound to the client lock, and materializes the working copy
    /// locally if this node doesn't have it yet.
    async fn bind_session(
        &self,
        caller: Caller,
        connection_id: Option<String>,
        video_id: &str,
        db: DatabaseName,
    ) -> Result<SessionBind, Error> {
        let Some(connection_id) = connection_id else {
            bail!(Unauthenticated, msg("missing connectionId parameter"));
        };
        let identity = caller.identity;
        {
            let state = self.registry.lock().get_state(video_id, db)?;
            let Some(state) = state else {
                bail!(Unauthenticated, msg("no lock state for {video_id}/{db}"));
            };
            if state.lock_type != LockType::Client
                || state.lock_holder_user_id.as_deref() != Some(identity.user_id.as_str())
                || state.active_connection_id.as_deref() != Some(connection_id.as_str())
            {
                bail!(
                    Unauthenticated,
                    msg("connection is not bound to the lock on {video_id}/{db}")
                );
            }
        }
        if !self
            .copies
            .has_working_copy(&identity.tenant_id, video_id, db)
        {
            match self
                .copies
                .download_from_store(&identity.tenant_id, video_id, db)
                .await
            {
                Ok(()) => {}
                // Nothing persisted yet; start from an empty copy.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(SessionBind {
            connection_id,
            user_id: identity.user_id,
            tenant_id: identity.tenant_id,
            video_id: video_id.to_owned(),
            database_name: db,
        })
    }
}
