// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The frameset version registry: immutable cropped-frameset artifacts,
//! at most one `active` per video.
//!
//! `version` numbers are unique and strictly increasing per video, and
//! activation is a single transaction that demotes the predecessor, so a
//! crashed workflow can never leave two active versions behind.

use base::clock::Clocks;
use base::{bail, err, Error};
use rusqlite::named_params;

use crate::registry::{from_micros, to_micros, LockedRegistry};

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Pending,
    Active,
    Archived,
    Failed,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Pending => "pending",
            VersionStatus::Active => "active",
            VersionStatus::Archived => "archived",
            VersionStatus::Failed => "failed",
        }
    }

    fn from_sql(v: &str) -> Result<Self, Error> {
        match v {
            "pending" => Ok(VersionStatus::Pending),
            "active" => Ok(VersionStatus::Active),
            "archived" => Ok(VersionStatus::Archived),
            "failed" => Ok(VersionStatus::Failed),
            o => Err(err!(DataLoss, msg("unknown version status {o:?}"))),
        }
    }
}

/// Pixel bounds of the crop region, inclusive-exclusive.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CropBounds {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FramesetVersion {
    pub video_id: String,
    pub version: u32,
    pub status: VersionStatus,
    pub storage_prefix: String,
    pub crop_bounds: CropBounds,
    pub frame_rate: f64,
    pub source_layout_hash: String,
    pub chunk_count: Option<u32>,
    pub total_frames: Option<u64>,
    pub total_size_bytes: Option<u64>,
    pub created_at: jiff::Timestamp,
    pub created_by_user_id: Option<String>,
    pub flow_run_id: Option<String>,
}

/// Fields supplied when a workflow creates a pending version row.
#[derive(Clone, Debug)]
pub struct FramesetVersionInsert {
    pub crop_bounds: CropBounds,
    pub frame_rate: f64,
    pub source_layout_hash: String,
    pub created_by_user_id: Option<String>,
    pub flow_run_id: Option<String>,
}

const VERSION_COLS: &str = "video_id, version, status, storage_prefix, crop_left, crop_top, \
     crop_right, crop_bottom, frame_rate, source_layout_hash, chunk_count, total_frames, \
     total_size_bytes, created_at, created_by_user_id, flow_run_id";

fn version_from_row(row: &rusqlite::Row) -> rusqlite::Result<FramesetVersion> {
    let status: String = row.get(2)?;
    Ok(FramesetVersion {
        video_id: row.get(0)?,
        version: row.get::<_, i64>(1)? as u32,
        status: VersionStatus::from_sql(&status).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown version status {status:?}").into(),
            )
        })?,
        storage_prefix: row.get(3)?,
        crop_bounds: CropBounds {
            left: row.get(4)?,
            top: row.get(5)?,
            right: row.get(6)?,
            bottom: row.get(7)?,
        },
        frame_rate: row.get(8)?,
        source_layout_hash: row.get(9)?,
        chunk_count: row.get::<_, Option<i64>>(10)?.map(|v| v as u32),
        total_frames: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        total_size_bytes: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
        created_at: from_micros(row.get(13)?)?,
        created_by_user_id: row.get(14)?,
        flow_run_id: row.get(15)?,
    })
}

impl<C: Clocks + Clone> LockedRegistry<C> {
    /// Allocates the next version number for a video.
    pub fn next_frameset_version(&mut self, video_id: &str) -> Result<u32, Error> {
        let mut stmt = self.conn().prepare_cached(
            "select coalesce(max(version), 0) from frameset_version where video_id = :video_id",
        )?;
        let max: i64 = stmt.query_row(named_params! {":video_id": video_id}, |r| r.get(0))?;
        Ok(max as u32 + 1)
    }

    /// Creates the version row with `status = pending`.
    pub fn create_frameset_version(
        &mut self,
        video_id: &str,
        version: u32,
        storage_prefix: &str,
        insert: &FramesetVersionInsert,
    ) -> Result<FramesetVersion, Error> {
        let now = to_micros(self.now());
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "insert into frameset_version \
             (video_id, version, status, storage_prefix, crop_left, crop_top, crop_right, \
              crop_bottom, frame_rate, source_layout_hash, created_at, created_by_user_id, \
              flow_run_id) \
             values (:video_id, :version, 'pending', :storage_prefix, :crop_left, :crop_top, \
                     :crop_right, :crop_bottom, :frame_rate, :source_layout_hash, :created_at, \
                     :created_by_user_id, :flow_run_id)",
        )?;
        stmt.execute(named_params! {
            ":video_id": video_id,
            ":version": version as i64,
            ":storage_prefix": storage_prefix,
            ":crop_left": insert.crop_bounds.left,
            ":crop_top": insert.crop_bounds.top,
            ":crop_right": insert.crop_bounds.right,
            ":crop_bottom": insert.crop_bounds.bottom,
            ":frame_rate": insert.frame_rate,
            ":source_layout_hash": insert.source_layout_hash,
            ":created_at": now,
            ":created_by_user_id": insert.created_by_user_id,
            ":flow_run_id": insert.flow_run_id,
        })?;
        drop(stmt);
        let _ = conn;
        self.get_frameset_version(video_id, version)?
            .ok_or_else(|| err!(Internal, msg("version row vanished after insert")))
    }

    pub fn get_frameset_version(
        &mut self,
        video_id: &str,
        version: u32,
    ) -> Result<Option<FramesetVersion>, Error> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "select {VERSION_COLS} from frameset_version \
             where video_id = :video_id and version = :version"
        ))?;
        let mut rows = stmt.query(named_params! {
            ":video_id": video_id,
            ":version": version as i64,
        })?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(version_from_row(row)?)),
        }
    }

    pub fn list_frameset_versions(
        &mut self,
        video_id: &str,
    ) -> Result<Vec<FramesetVersion>, Error> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "select {VERSION_COLS} from frameset_version \
             where video_id = :video_id order by version"
        ))?;
        let mut rows = stmt.query(named_params! {":video_id": video_id})?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(version_from_row(row)?);
        }
        Ok(out)
    }

    pub fn active_frameset_version(
        &mut self,
        video_id: &str,
    ) -> Result<Option<FramesetVersion>, Error> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "select {VERSION_COLS} from frameset_version \
             where video_id = :video_id and status = 'active'"
        ))?;
        let mut rows = stmt.query(named_params! {":video_id": video_id})?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(version_from_row(row)?)),
        }
    }

    /// Records chunk totals once the external job has produced its output.
    pub fn update_frameset_totals(
        &mut self,
        video_id: &str,
        version: u32,
        chunk_count: u32,
        total_frames: u64,
        total_size_bytes: u64,
    ) -> Result<(), Error> {
        let mut stmt = self.conn().prepare_cached(
            "update frameset_version \
             set chunk_count = :chunk_count, total_frames = :total_frames, \
                 total_size_bytes = :total_size_bytes \
             where video_id = :video_id and version = :version",
        )?;
        let rows = stmt.execute(named_params! {
            ":chunk_count": chunk_count as i64,
            ":total_frames": total_frames as i64,
            ":total_size_bytes": total_size_bytes as i64,
            ":video_id": video_id,
            ":version": version as i64,
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no frameset version {video_id}/v{version}"));
        }
        Ok(())
    }

    /// Atomically activates `version`: demotes the previous `active` row to
    /// `archived`, promotes this row from `pending`, and repoints the video.
    pub fn activate_frameset_version(&mut self, video_id: &str, version: u32) -> Result<(), Error> {
        let tx = self.conn().transaction()?;
        tx.execute(
            "update frameset_version set status = 'archived' \
             where video_id = :video_id and status = 'active'",
            named_params! {":video_id": video_id},
        )?;
        let rows = tx.execute(
            "update frameset_version set status = 'active' \
             where video_id = :video_id and version = :version and status = 'pending'",
            named_params! {":video_id": video_id, ":version": version as i64},
        )?;
        if rows != 1 {
            // Rolls back the demotion along with everything else.
            bail!(
                FailedPrecondition,
                msg("frameset version {video_id}/v{version} is not pending")
            );
        }
        tx.execute(
            "update video set current_frameset_version = :version where id = :video_id",
            named_params! {":version": version as i64, ":video_id": video_id},
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Marks a version failed; the previous active version is untouched.
    pub fn mark_frameset_version_failed(
        &mut self,
        video_id: &str,
        version: u32,
    ) -> Result<(), Error> {
        let mut stmt = self.conn().prepare_cached(
            "update frameset_version set status = 'failed' \
             where video_id = :video_id and version = :version",
        )?;
        stmt.execute(named_params! {":video_id": video_id, ":version": version as i64})?;
        Ok(())
    }
}
