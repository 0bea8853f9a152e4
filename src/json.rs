// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! JSON types on the wire.
//!
//! REST bodies use camelCase field names; websocket frames use the
//! `{type: ...}` tagged shape with snake_case fields. Row deltas pass
//! through verbatim in both directions.

use db::captions::{BatchError, BatchResultItem, Caption, OverlapResolution};
use db::registry::{DatabaseState, LockType, Video};
use db::versions::CropBounds;
use db::RowDelta;
use serde::{Deserialize, Serialize};

fn ts_string(t: jiff::Timestamp) -> String {
    t.to_string()
}

/// `GET /videos/{id}` response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoView {
    pub id: String,
    pub title: Option<String>,
    pub status: db::VideoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_frames: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    pub current_frameset_version: Option<u32>,
    pub created_at: String,
}

impl VideoView {
    pub fn from_video(v: &Video) -> Self {
        VideoView {
            id: v.id.clone(),
            title: v.title.clone(),
            status: v.status,
            duration_frames: v.duration_frames,
            frame_rate: v.frame_rate,
            current_frameset_version: v.current_frameset_version,
            created_at: ts_string(v.created_at),
        }
    }
}

/// `GET /videos/{id}/database/{db}/state` response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStateView {
    pub server_version: u64,
    pub wasabi_version: u64,
    pub wasabi_synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasabi_synced_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
    pub lock_type: LockType,
    pub lock_holder_user_id: Option<String>,
    pub lock_holder_is_you: bool,
}

impl DatabaseStateView {
    pub fn from_state(s: &DatabaseState, caller_user_id: &str) -> Self {
        DatabaseStateView {
            server_version: s.server_version,
            wasabi_version: s.wasabi_version,
            wasabi_synced: s.wasabi_version >= s.server_version && s.wasabi_version > 0,
            wasabi_synced_at: s.wasabi_synced_at.map(ts_string),
            last_activity_at: s.last_activity_at.map(ts_string),
            lock_type: s.lock_type,
            lock_holder_user_id: s.lock_holder_user_id.clone(),
            lock_holder_is_you: s.lock_holder_user_id.as_deref() == Some(caller_user_id),
        }
    }
}

/// `POST /videos/{id}/database/{db}/lock` response.
#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasabi_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_download: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_holder_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Serialize)]
pub struct CaptionListResponse {
    pub captions: Vec<Caption>,
}

#[derive(Serialize)]
pub struct CaptionResponse {
    pub caption: Caption,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlapResolutionResponse {
    pub caption: Caption,
    pub deleted_captions: Vec<i64>,
    pub modified_captions: Vec<Caption>,
    pub created_gaps: Vec<Caption>,
}

impl OverlapResolutionResponse {
    pub fn from_resolution(r: &OverlapResolution) -> Self {
        OverlapResolutionResponse {
            caption: r.caption.clone(),
            deleted_captions: r.deleted_captions.clone(),
            modified_captions: r.modified_captions.clone(),
            created_gaps: r.created_gaps.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<db::captions::BatchItem>,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<BatchResultItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

/// `POST /videos/{id}/actions/approve-layout` request. This body predates
/// the camelCase convention and is snake_case for compatibility.
#[derive(Deserialize)]
pub struct ApproveLayoutRequest {
    #[serde(rename = "type")]
    pub action_type: String,
    pub crop_region: CropBounds,
}

pub const APPROVE_LAYOUT_ACTION: &str = "crop-and-infer-caption-frame-extents";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
}

/// Inbound object-store webhook body.
#[derive(Deserialize)]
pub struct WebhookRequest {
    #[serde(rename = "type")]
    pub change_type: String,
    pub table: String,
    #[serde(default)]
    pub record: Option<WebhookRecord>,
}

#[derive(Deserialize)]
pub struct WebhookRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub storage_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Client-to-server websocket frames.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Sync { changes: Vec<RowDelta> },
}

/// The frame types a client may send; used to distinguish `UNKNOWN_TYPE`
/// from `INVALID_FORMAT`.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &["ping", "sync"];

/// Server-to-client websocket frames.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    Ack {
        server_version: u64,
        applied_count: usize,
    },
    ServerUpdate {
        changes: Vec<RowDelta>,
        server_version: u64,
    },
    LockChanged {
        lock_type: LockType,
        reason: String,
    },
    SessionTransferred,
    Error {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Serialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidFormat,
    UnknownType,
    SessionTransferred,
    WorkflowLocked,
    Unauthenticated,
}
