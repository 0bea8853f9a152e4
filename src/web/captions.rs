// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Caption CRUD endpoints.
//!
//! Mutations require the caller to hold the client lock on the captions
//! database: the interval invariants cross many rows, so writes are
//! serialized through the same lock the websocket sync uses. Each mutation
//! bumps `server_version` and broadcasts the resulting deltas to any bound
//! sync session.

use base::clock::Clocks;
use base::{err, ErrorKind};
use db::captions::{
    BatchOutcome, CaptionCreate, CaptionRepository, CaptionTextUpdate, CaptionUpdate,
};
use db::registry::{DatabaseName, LockType};
use db::workingcopy::Handle;
use db::RowDelta;
use http::{Request, StatusCode};
use hyper::Body;

use super::{
    bad_req, extract_json_body, not_found, parse_json_body, serve_json, serve_json_status, Caller,
    HttpError, ResponseResult, Service,
};
use crate::json;

impl<C: Clocks + Clone> Service<C> {
    /// Opens the captions working copy for repository access, pulling it
    /// from the object store first if this node doesn't have it.
    async fn captions_handle(&self, tenant_id: &str, video_id: &str) -> Result<Handle, HttpError> {
        if !self
            .copies
            .has_working_copy(tenant_id, video_id, DatabaseName::Captions)
        {
            match self
                .copies
                .download_from_store(tenant_id, video_id, DatabaseName::Captions)
                .await
            {
                Ok(()) => {}
                // Nothing persisted yet; start from an empty copy.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self
            .copies
            .open_for_repo(tenant_id, video_id, DatabaseName::Captions)
            .await?)
    }

    /// Caption writes run under the client lock.
    fn require_captions_lock(&self, caller: &Caller, video_id: &str) -> Result<(), HttpError> {
        let state = self
            .registry
            .lock()
            .get_state(video_id, DatabaseName::Captions)?;
        match state {
            Some(s)
                if s.lock_type == LockType::Client
                    && s.lock_holder_user_id.as_deref()
                        == Some(caller.identity.user_id.as_str()) =>
            {
                Ok(())
            }
            Some(s) if s.lock_type == LockType::Server => Err(err!(
                FailedPrecondition,
                msg("a workflow holds the captions lock for {video_id}")
            )
            .into()),
            _ => Err(err!(
                FailedPrecondition,
                msg("acquire the captions lock for {video_id} before writing")
            )
            .into()),
        }
    }

    /// Bumps `server_version` and relays the deltas to bound sync sessions.
    fn record_caption_mutation(
        &self,
        caller: &Caller,
        video_id: &str,
        deltas: &[RowDelta],
    ) -> Result<u64, HttpError> {
        let version = {
            let mut l = self.registry.lock();
            l.get_or_create_state(video_id, DatabaseName::Captions, &caller.identity.tenant_id)?;
            l.increment_server_version(video_id, DatabaseName::Captions)?
        };
        self.sessions
            .broadcast_update(video_id, DatabaseName::Captions, None, deltas, version);
        Ok(version)
    }

    pub(super) async fn list_captions(
        &self,
        req: &Request<Body>,
        caller: &Caller,
        video_id: &str,
    ) -> ResponseResult {
        self.require_video(video_id, caller)?;
        let start = Self::query_param(req, "start")
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|_| bad_req("unparseable start"))?;
        let end = Self::query_param(req, "end")
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|_| bad_req("unparseable end"))?;
        let workable = Self::query_param(req, "workable")
            .map(|v| v == "true")
            .unwrap_or(false);
        let limit = Self::query_param(req, "limit")
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|_| bad_req("unparseable limit"))?;

        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, video_id)
            .await?;
        let captions = CaptionRepository::new(&mut handle).list(start, end, workable, limit)?;
        serve_json(&json::CaptionListResponse { captions })
    }

    pub(super) async fn get_caption(
        &self,
        caller: &Caller,
        video_id: &str,
        caption_id: i64,
    ) -> ResponseResult {
        self.require_video(video_id, caller)?;
        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, video_id)
            .await?;
        let caption = CaptionRepository::new(&mut handle)
            .get(caption_id)?
            .ok_or_else(|| not_found(format!("Caption {caption_id} not found")))?;
        serve_json(&json::CaptionResponse { caption })
    }

    pub(super) async fn create_caption(
        &self,
        mut req: Request<Body>,
        caller: Caller,
        video_id: String,
    ) -> ResponseResult {
        self.require_video(&video_id, &caller)?;
        self.require_captions_lock(&caller, &video_id)?;
        let body = extract_json_body(&mut req).await?;
        let input: CaptionCreate = parse_json_body(&body)?;
        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, &video_id)
            .await?;
        let (caption, deltas) = CaptionRepository::new(&mut handle).create(&input)?;
        drop(handle);
        self.record_caption_mutation(&caller, &video_id, &deltas)?;
        serve_json_status(StatusCode::CREATED, &json::CaptionResponse { caption })
    }

    pub(super) async fn update_caption(
        &self,
        mut req: Request<Body>,
        caller: Caller,
        video_id: String,
        caption_id: i64,
    ) -> ResponseResult {
        self.require_video(&video_id, &caller)?;
        self.require_captions_lock(&caller, &video_id)?;
        let body = extract_json_body(&mut req).await?;
        let input: CaptionUpdate = parse_json_body(&body)?;
        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, &video_id)
            .await?;
        let resolution =
            CaptionRepository::new(&mut handle).update_with_overlap_resolution(caption_id, &input)?;
        drop(handle);
        self.record_caption_mutation(&caller, &video_id, &resolution.deltas)?;
        serve_json(&json::OverlapResolutionResponse::from_resolution(&resolution))
    }

    pub(super) async fn update_caption_text(
        &self,
        mut req: Request<Body>,
        caller: Caller,
        video_id: String,
        caption_id: i64,
    ) -> ResponseResult {
        self.require_video(&video_id, &caller)?;
        self.require_captions_lock(&caller, &video_id)?;
        let body = extract_json_body(&mut req).await?;
        let input: CaptionTextUpdate = parse_json_body(&body)?;
        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, &video_id)
            .await?;
        let (caption, deltas) =
            CaptionRepository::new(&mut handle).update_text(caption_id, &input)?;
        drop(handle);
        self.record_caption_mutation(&caller, &video_id, &deltas)?;
        serve_json(&json::CaptionResponse { caption })
    }

    pub(super) async fn delete_caption(
        &self,
        caller: &Caller,
        video_id: &str,
        caption_id: i64,
    ) -> ResponseResult {
        self.require_video(video_id, caller)?;
        self.require_captions_lock(caller, video_id)?;
        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, video_id)
            .await?;
        let deltas = CaptionRepository::new(&mut handle).delete(caption_id)?;
        drop(handle);
        self.record_caption_mutation(caller, video_id, &deltas)?;
        serve_json(&json::DeleteResponse { deleted: true })
    }

    pub(super) async fn batch_captions(
        &self,
        mut req: Request<Body>,
        caller: Caller,
        video_id: String,
    ) -> ResponseResult {
        self.require_video(&video_id, &caller)?;
        self.require_captions_lock(&caller, &video_id)?;
        let body = extract_json_body(&mut req).await?;
        let input: json::BatchRequest = parse_json_body(&body)?;
        let mut handle = self
            .captions_handle(&caller.identity.tenant_id, &video_id)
            .await?;
        let outcome = CaptionRepository::new(&mut handle).batch(&input.operations)?;
        drop(handle);
        match outcome {
            BatchOutcome::Applied { results, deltas } => {
                if !deltas.is_empty() {
                    self.record_caption_mutation(&caller, &video_id, &deltas)?;
                }
                serve_json(&json::BatchResponse {
                    success: true,
                    results: Some(results),
                    error: None,
                })
            }
            BatchOutcome::Failed(error) => serve_json(&json::BatchResponse {
                success: false,
                results: None,
                error: Some(error),
            }),
        }
    }
}
