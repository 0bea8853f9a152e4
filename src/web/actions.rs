// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The approve-layout action and the inbound object-store webhook.

use base::clock::Clocks;
use db::auth::webhook_secret_matches;
use db::object::ObjectKey;
use db::registry::VideoChange;
use http::{header, Method, Request, StatusCode};
use hyper::Body;
use tracing::{info, warn};

use super::{
    bad_req, extract_json_body, parse_json_body, plain_response, serve_json, Caller,
    ResponseResult, Service,
};
use crate::json;

impl<C: Clocks + Clone> Service<C> {
    pub(super) async fn approve_layout(
        &self,
        mut req: Request<Body>,
        caller: Caller,
        video_id: String,
    ) -> ResponseResult {
        self.require_video(&video_id, &caller)?;
        let body = extract_json_body(&mut req).await?;
        let input: json::ApproveLayoutRequest = parse_json_body(&body)?;
        if input.action_type != json::APPROVE_LAYOUT_ACTION {
            return Err(bad_req(format!(
                "unknown action type {:?}",
                input.action_type
            )));
        }
        let run_id = self.publisher.spawn(
            &video_id,
            input.crop_region,
            Some(caller.identity.user_id.clone()),
        )?;
        serve_json(&json::JobResponse {
            job_id: run_id.to_string(),
        })
    }

    /// Handles `POST /webhooks/object-store/videos`. Authenticated by the
    /// shared webhook secret, not a user token. Only `INSERT` does
    /// anything: it registers the video and kicks off the external
    /// initial-processing pipeline.
    pub(super) async fn webhook(&self, mut req: Request<Body>) -> ResponseResult {
        if *req.method() != Method::POST {
            return Ok(plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "POST expected",
            ));
        }
        let authorized = match (
            &self.webhook_secret,
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer ")),
        ) {
            (Some(configured), Some(presented)) => webhook_secret_matches(configured, presented),
            _ => false,
        };
        if !authorized {
            // Never log the presented value.
            warn!("webhook request with missing or bad secret");
            return Ok(plain_response(StatusCode::UNAUTHORIZED, "bad secret"));
        }

        let body = extract_json_body(&mut req).await?;
        let input: json::WebhookRequest = parse_json_body(&body)?;
        if input.table != "videos" {
            return Err(bad_req(format!("unexpected table {:?}", input.table)));
        }
        match input.change_type.as_str() {
            "INSERT" => {}
            "UPDATE" | "DELETE" => {
                return serve_json(&json::WebhookResponse {
                    status: "ignored",
                    job_id: None,
                });
            }
            other => return Err(bad_req(format!("unexpected change type {other:?}"))),
        }
        let record = input.record.ok_or_else(|| bad_req("missing record"))?;
        let (Some(id), Some(tenant_id)) = (record.id, record.tenant_id) else {
            return Err(bad_req("record is missing id or tenant_id"));
        };
        let storage_key = record
            .storage_key
            .unwrap_or_else(|| ObjectKey::video_media(&tenant_id, &id).as_str().to_owned());
        let created = self.registry.lock().upsert_video(VideoChange {
            id: id.clone(),
            tenant_id,
            title: record.title,
            storage_key,
        })?;
        if !created {
            info!("webhook re-delivered insert for known video {id}");
            return serve_json(&json::WebhookResponse {
                status: "accepted",
                job_id: None,
            });
        }

        let job_id = match &self.ingest {
            None => None,
            Some(launcher) => {
                let video = self
                    .registry
                    .lock()
                    .get_video(&id)?
                    .expect("video row was just inserted");
                match launcher.launch(&video).await {
                    Ok(job_id) => Some(job_id),
                    Err(e) => {
                        // Registration already happened; the pipeline can be
                        // re-driven later, so don't fail the webhook.
                        warn!(err = %e.chain(), "unable to launch ingest for {id}");
                        None
                    }
                }
            }
        };
        info!("registered video {id} from webhook");
        serve_json(&json::WebhookResponse {
            status: "accepted",
            job_id,
        })
    }
}
