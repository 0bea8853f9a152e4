// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Caption frame-extent repository: the one piece of domain logic that must
//! run under the database lock, because updating a caption's extents
//! rewrites an ordered interval set whose invariants cross many rows.
//!
//! Every operation runs in a single transaction on the working copy and
//! records its writes into the CRDT change log so they replicate to
//! connected peers like any client edit. Failure of any step rolls the
//! whole operation back.

use base::{bail, err, Error};
use rusqlite::{named_params, params, OptionalExtension as _};
use serde_json::Value;

use crate::workingcopy::{ChangeRecorder, Handle, RowDelta};

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtentsState {
    Predicted,
    Confirmed,
    Gap,
    Issue,
}

impl ExtentsState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtentsState::Predicted => "predicted",
            ExtentsState::Confirmed => "confirmed",
            ExtentsState::Gap => "gap",
            ExtentsState::Issue => "issue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "predicted" => Some(ExtentsState::Predicted),
            "confirmed" => Some(ExtentsState::Confirmed),
            "gap" => Some(ExtentsState::Gap),
            "issue" => Some(ExtentsState::Issue),
            _ => None,
        }
    }
}

/// One row of the `captions` table, in wire (camelCase) form.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Caption {
    pub id: i64,
    pub start_frame_index: i64,
    pub end_frame_index: i64,
    pub caption_frame_extents_state: ExtentsState,
    pub caption_frame_extents_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_frame_extents_updated_at: Option<String>,
    pub text: Option<String>,
    pub text_pending: bool,
    pub text_status: Option<String>,
    pub text_notes: Option<String>,
    pub caption_ocr: Option<String>,
    pub caption_ocr_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_ocr_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_ocr_processed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_updated_at: Option<String>,
    pub image_needs_regen: bool,
    pub created_at: String,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionCreate {
    pub start_frame_index: i64,
    pub end_frame_index: i64,
    pub caption_frame_extents_state: ExtentsState,
    #[serde(default)]
    pub caption_frame_extents_pending: bool,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionUpdate {
    pub start_frame_index: i64,
    pub end_frame_index: i64,
    pub caption_frame_extents_state: ExtentsState,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionTextUpdate {
    pub text: Option<String>,
    #[serde(default)]
    pub text_status: Option<String>,
    #[serde(default)]
    pub text_notes: Option<String>,
}

/// Result of an extents update, including everything the client needs to
/// patch its local view and the deltas the sync layer broadcasts.
#[derive(Clone, Debug)]
pub struct OverlapResolution {
    pub caption: Caption,
    pub deleted_captions: Vec<i64>,
    pub modified_captions: Vec<Caption>,
    pub created_gaps: Vec<Caption>,
    pub deltas: Vec<RowDelta>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOp {
    Create,
    Update,
    Delete,
}

impl BatchOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchOp::Create => "create",
            BatchOp::Update => "update",
            BatchOp::Delete => "delete",
        }
    }
}

/// Partial caption fields accepted by batch create/update operations.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchData {
    pub start_frame_index: Option<i64>,
    pub end_frame_index: Option<i64>,
    pub caption_frame_extents_state: Option<ExtentsState>,
    pub text: Option<String>,
    pub text_status: Option<String>,
    pub text_notes: Option<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct BatchItem {
    pub op: BatchOp,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub data: Option<BatchData>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct BatchResultItem {
    pub op: BatchOp,
    pub id: i64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct BatchError {
    pub index: usize,
    pub op: BatchOp,
    pub message: String,
}

/// Outcome of a batch: either every operation applied, or the index of the
/// first failure (with the whole transaction rolled back).
#[derive(Debug)]
pub enum BatchOutcome {
    Applied {
        results: Vec<BatchResultItem>,
        deltas: Vec<RowDelta>,
    },
    Failed(BatchError),
}

const CAPTION_COLS: &str = "id, start_frame_index, end_frame_index, caption_frame_extents_state, \
     caption_frame_extents_pending, caption_frame_extents_updated_at, text, text_pending, \
     text_status, text_notes, caption_ocr, caption_ocr_status, caption_ocr_error, \
     caption_ocr_processed_at, text_updated_at, image_needs_regen, created_at";

fn caption_from_row(row: &rusqlite::Row) -> rusqlite::Result<Caption> {
    let state: String = row.get(3)?;
    Ok(Caption {
        id: row.get(0)?,
        start_frame_index: row.get(1)?,
        end_frame_index: row.get(2)?,
        caption_frame_extents_state: ExtentsState::parse(&state).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown extents state {state:?}").into(),
            )
        })?,
        caption_frame_extents_pending: row.get::<_, i64>(4)? != 0,
        caption_frame_extents_updated_at: row.get(5)?,
        text: row.get(6)?,
        text_pending: row.get::<_, i64>(7)? != 0,
        text_status: row.get(8)?,
        text_notes: row.get(9)?,
        caption_ocr: row.get(10)?,
        caption_ocr_status: row.get(11)?,
        caption_ocr_error: row.get(12)?,
        caption_ocr_processed_at: row.get(13)?,
        text_updated_at: row.get(14)?,
        image_needs_regen: row.get::<_, i64>(15)? != 0,
        created_at: row.get(16)?,
    })
}

fn get_in_tx(tx: &rusqlite::Transaction, id: i64) -> Result<Option<Caption>, Error> {
    let mut stmt = tx.prepare_cached(&format!(
        "select {CAPTION_COLS} from captions where id = :id"
    ))?;
    Ok(stmt
        .query_row(named_params! {":id": id}, caption_from_row)
        .optional()?)
}

fn log_cols(
    recorder: &mut ChangeRecorder,
    tx: &rusqlite::Transaction,
    id: i64,
    cols: &[(&str, Value)],
) -> Result<(), Error> {
    for (cid, val) in cols {
        recorder.log(tx, "captions", id, cid, val.clone())?;
    }
    Ok(())
}

/// Data access layer for caption operations on one captions working copy.
pub struct CaptionRepository<'h> {
    handle: &'h mut Handle,
}

impl<'h> CaptionRepository<'h> {
    pub fn new(handle: &'h mut Handle) -> Self {
        CaptionRepository { handle }
    }

    /// Lists captions ordered by `start_frame_index`, optionally filtered to
    /// an overlapping frame range and/or to workable rows (gaps or pending).
    pub fn list(
        &mut self,
        start_frame: Option<i64>,
        end_frame: Option<i64>,
        workable_only: bool,
        limit: Option<u32>,
    ) -> Result<Vec<Caption>, Error> {
        let mut conditions = Vec::new();
        let mut params_vec: Vec<i64> = Vec::new();
        if let (Some(start), Some(end)) = (start_frame, end_frame) {
            conditions.push("end_frame_index >= ? and start_frame_index <= ?");
            params_vec.push(start);
            params_vec.push(end);
        }
        if workable_only {
            conditions
                .push("(caption_frame_extents_state = 'gap' or caption_frame_extents_pending = 1)");
        }
        let mut sql = format!("select {CAPTION_COLS} from captions");
        if !conditions.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&conditions.join(" and "));
        }
        sql.push_str(" order by start_frame_index");
        if let Some(limit) = limit {
            sql.push_str(&format!(" limit {limit}"));
        }
        let conn = self.handle.conn_mut();
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params_vec))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(caption_from_row(row)?);
        }
        Ok(out)
    }

    pub fn get(&mut self, id: i64) -> Result<Option<Caption>, Error> {
        let conn = self.handle.conn_mut();
        let mut stmt = conn.prepare_cached(&format!(
            "select {CAPTION_COLS} from captions where id = :id"
        ))?;
        Ok(stmt
            .query_row(named_params! {":id": id}, caption_from_row)
            .optional()?)
    }

    /// Creates a caption. Does NOT perform overlap resolution; the update
    /// path owns that.
    pub fn create(&mut self, input: &CaptionCreate) -> Result<(Caption, Vec<RowDelta>), Error> {
        if input.start_frame_index < 0 || input.end_frame_index < input.start_frame_index {
            bail!(
                InvalidArgument,
                msg(
                    "invalid extents [{}, {}]",
                    input.start_frame_index,
                    input.end_frame_index
                )
            );
        }
        let tx = self.handle.conn_mut().transaction()?;
        let mut recorder = ChangeRecorder::begin(&tx)?;
        let (caption, deltas) = {
            let id = insert_caption(&tx, &mut recorder, input)?;
            let caption = get_in_tx(&tx, id)?
                .ok_or_else(|| err!(Internal, msg("caption {id} vanished after insert")))?;
            let deltas = recorder.finish(&tx)?;
            (caption, deltas)
        };
        tx.commit()?;
        Ok((caption, deltas))
    }

    /// Updates caption frame extents with atomic overlap resolution: rows
    /// contained in the new range are deleted, straddling rows are split,
    /// overhangs are trimmed, and uncovered ranges left behind by a shrink
    /// become gap captions (absorbing any adjacent gaps).
    pub fn update_with_overlap_resolution(
        &mut self,
        id: i64,
        input: &CaptionUpdate,
    ) -> Result<OverlapResolution, Error> {
        let (new_start, new_end) = (input.start_frame_index, input.end_frame_index);
        if new_start < 0 || new_end < new_start {
            bail!(InvalidArgument, msg("invalid extents [{new_start}, {new_end}]"));
        }
        let tx = self.handle.conn_mut().transaction()?;
        let mut recorder = ChangeRecorder::begin(&tx)?;

        let original =
            get_in_tx(&tx, id)?.ok_or_else(|| err!(NotFound, msg("Caption {id} not found")))?;

        let mut deleted_captions = Vec::new();
        let mut modified_captions = Vec::new();

        for overlap in detect_overlaps(&tx, new_start, new_end, Some(id))? {
            resolve_overlap(
                &tx,
                &mut recorder,
                &overlap,
                new_start,
                new_end,
                &mut deleted_captions,
                &mut modified_captions,
            )?;
        }

        // Gap backfill for ranges the caption no longer covers.
        let mut created_gaps = Vec::new();
        if new_start > original.start_frame_index {
            if let Some(gap) = create_or_merge_gap(
                &tx,
                &mut recorder,
                original.start_frame_index,
                new_start - 1,
            )? {
                created_gaps.push(gap);
            }
        }
        if new_end < original.end_frame_index {
            if let Some(gap) =
                create_or_merge_gap(&tx, &mut recorder, new_end + 1, original.end_frame_index)?
            {
                created_gaps.push(gap);
            }
        }

        let boundaries_changed =
            new_start != original.start_frame_index || new_end != original.end_frame_index;
        {
            let mut stmt = tx.prepare_cached(
                "update captions \
                 set start_frame_index = :start, \
                     end_frame_index = :end, \
                     caption_frame_extents_state = :state, \
                     caption_frame_extents_pending = 0, \
                     image_needs_regen = :needs_regen, \
                     caption_frame_extents_updated_at = datetime('now') \
                 where id = :id",
            )?;
            stmt.execute(named_params! {
                ":start": new_start,
                ":end": new_end,
                ":state": input.caption_frame_extents_state.as_str(),
                ":needs_regen": boundaries_changed as i64,
                ":id": id,
            })?;
        }
        log_cols(
            &mut recorder,
            &tx,
            id,
            &[
                ("start_frame_index", Value::from(new_start)),
                ("end_frame_index", Value::from(new_end)),
                (
                    "caption_frame_extents_state",
                    Value::from(input.caption_frame_extents_state.as_str()),
                ),
                ("caption_frame_extents_pending", Value::from(0)),
                ("image_needs_regen", Value::from(boundaries_changed as i64)),
            ],
        )?;

        let caption = get_in_tx(&tx, id)?
            .ok_or_else(|| err!(Internal, msg("caption {id} vanished during update")))?;
        let deltas = recorder.finish(&tx)?;
        tx.commit()?;
        Ok(OverlapResolution {
            caption,
            deleted_captions,
            modified_captions,
            created_gaps,
            deltas,
        })
    }

    /// Text-only update; clears `text_pending`.
    pub fn update_text(
        &mut self,
        id: i64,
        input: &CaptionTextUpdate,
    ) -> Result<(Caption, Vec<RowDelta>), Error> {
        let tx = self.handle.conn_mut().transaction()?;
        let mut recorder = ChangeRecorder::begin(&tx)?;
        {
            let mut stmt = tx.prepare_cached(
                "update captions \
                 set text = :text, text_status = :text_status, text_notes = :text_notes, \
                     text_pending = 0, text_updated_at = datetime('now') \
                 where id = :id",
            )?;
            let rows = stmt.execute(named_params! {
                ":text": input.text,
                ":text_status": input.text_status,
                ":text_notes": input.text_notes,
                ":id": id,
            })?;
            if rows == 0 {
                bail!(NotFound, msg("Caption {id} not found"));
            }
        }
        log_cols(
            &mut recorder,
            &tx,
            id,
            &[
                ("text", json_opt(&input.text)),
                ("text_status", json_opt(&input.text_status)),
                ("text_notes", json_opt(&input.text_notes)),
                ("text_pending", Value::from(0)),
            ],
        )?;
        let caption = get_in_tx(&tx, id)?
            .ok_or_else(|| err!(Internal, msg("caption {id} vanished during update")))?;
        let deltas = recorder.finish(&tx)?;
        tx.commit()?;
        Ok((caption, deltas))
    }

    pub fn delete(&mut self, id: i64) -> Result<Vec<RowDelta>, Error> {
        let tx = self.handle.conn_mut().transaction()?;
        let mut recorder = ChangeRecorder::begin(&tx)?;
        let rows = tx.execute("delete from captions where id = ?", params![id])?;
        if rows == 0 {
            bail!(NotFound, msg("Caption {id} not found"));
        }
        recorder.log_delete(&tx, "captions", id)?;
        let deltas = recorder.finish(&tx)?;
        tx.commit()?;
        Ok(deltas)
    }

    /// Applies a batch of operations in order inside one transaction. Any
    /// failure rolls back the entire batch and reports the failing index.
    /// Create/delete here do not trigger overlap resolution; the client
    /// presents an already-resolved batch.
    pub fn batch(&mut self, operations: &[BatchItem]) -> Result<BatchOutcome, Error> {
        if operations.is_empty() {
            return Ok(BatchOutcome::Applied {
                results: Vec::new(),
                deltas: Vec::new(),
            });
        }
        let tx = self.handle.conn_mut().transaction()?;
        let mut recorder = ChangeRecorder::begin(&tx)?;
        let mut results = Vec::with_capacity(operations.len());
        for (index, operation) in operations.iter().enumerate() {
            match apply_batch_item(&tx, &mut recorder, operation) {
                Ok(id) => results.push(BatchResultItem {
                    op: operation.op,
                    id,
                }),
                Err(message) => {
                    tx.rollback()?;
                    return Ok(BatchOutcome::Failed(BatchError {
                        index,
                        op: operation.op,
                        message,
                    }));
                }
            }
        }
        let deltas = recorder.finish(&tx)?;
        tx.commit()?;
        Ok(BatchOutcome::Applied { results, deltas })
    }
}

fn json_opt(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::from(s.as_str()),
        None => Value::Null,
    }
}

fn insert_caption(
    tx: &rusqlite::Transaction,
    recorder: &mut ChangeRecorder,
    input: &CaptionCreate,
) -> Result<i64, Error> {
    let is_gap = input.caption_frame_extents_state == ExtentsState::Gap;
    let needs_regen = !(is_gap || input.caption_frame_extents_pending);
    let mut stmt = tx.prepare_cached(
        "insert into captions (start_frame_index, end_frame_index, \
             caption_frame_extents_state, caption_frame_extents_pending, text, \
             image_needs_regen) \
         values (:start, :end, :state, :pending, :text, :needs_regen)",
    )?;
    stmt.execute(named_params! {
        ":start": input.start_frame_index,
        ":end": input.end_frame_index,
        ":state": input.caption_frame_extents_state.as_str(),
        ":pending": input.caption_frame_extents_pending as i64,
        ":text": input.text,
        ":needs_regen": needs_regen as i64,
    })?;
    let id = tx.last_insert_rowid();
    recorder.log_create(tx, "captions", id)?;
    log_cols(
        recorder,
        tx,
        id,
        &[
            ("start_frame_index", Value::from(input.start_frame_index)),
            ("end_frame_index", Value::from(input.end_frame_index)),
            (
                "caption_frame_extents_state",
                Value::from(input.caption_frame_extents_state.as_str()),
            ),
            (
                "caption_frame_extents_pending",
                Value::from(input.caption_frame_extents_pending as i64),
            ),
            ("text", json_opt(&input.text)),
            ("image_needs_regen", Value::from(needs_regen as i64)),
        ],
    )?;
    Ok(id)
}

fn detect_overlaps(
    tx: &rusqlite::Transaction,
    start: i64,
    end: i64,
    exclude_id: Option<i64>,
) -> Result<Vec<Caption>, Error> {
    let mut stmt = tx.prepare_cached(&format!(
        "select {CAPTION_COLS} from captions \
         where id != :exclude \
           and not (end_frame_index < :start or start_frame_index > :end) \
         order by start_frame_index"
    ))?;
    let mut rows = stmt.query(named_params! {
        ":exclude": exclude_id.unwrap_or(-1),
        ":start": start,
        ":end": end,
    })?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(caption_from_row(row)?);
    }
    Ok(out)
}

fn set_extent(
    tx: &rusqlite::Transaction,
    recorder: &mut ChangeRecorder,
    id: i64,
    column: &str,
    value: i64,
) -> Result<(), Error> {
    // Column name comes from the fixed call sites below.
    let sql =
        format!("update captions set {column} = ?, caption_frame_extents_pending = 1 where id = ?");
    tx.execute(&sql, params![value, id])?;
    log_cols(
        recorder,
        tx,
        id,
        &[
            (column, Value::from(value)),
            ("caption_frame_extents_pending", Value::from(1)),
        ],
    )?;
    Ok(())
}

fn resolve_overlap(
    tx: &rusqlite::Transaction,
    recorder: &mut ChangeRecorder,
    overlap: &Caption,
    start: i64,
    end: i64,
    deleted: &mut Vec<i64>,
    modified: &mut Vec<Caption>,
) -> Result<(), Error> {
    if overlap.start_frame_index >= start && overlap.end_frame_index <= end {
        // Completely contained: delete.
        tx.execute("delete from captions where id = ?", params![overlap.id])?;
        recorder.log_delete(tx, "captions", overlap.id)?;
        deleted.push(overlap.id);
    } else if overlap.start_frame_index < start && overlap.end_frame_index > end {
        // The new range sits inside this caption: split. The left part keeps
        // the id; the right part is a new row with the same state and text.
        set_extent(tx, recorder, overlap.id, "end_frame_index", start - 1)?;
        if let Some(left) = get_in_tx(tx, overlap.id)? {
            modified.push(left);
        }
        let right = insert_caption(
            tx,
            recorder,
            &CaptionCreate {
                start_frame_index: end + 1,
                end_frame_index: overlap.end_frame_index,
                caption_frame_extents_state: overlap.caption_frame_extents_state,
                caption_frame_extents_pending: true,
                text: overlap.text.clone(),
            },
        )?;
        if let Some(right) = get_in_tx(tx, right)? {
            modified.push(right);
        }
    } else if overlap.start_frame_index < start {
        // Left overhang: trim the right side.
        set_extent(tx, recorder, overlap.id, "end_frame_index", start - 1)?;
        if let Some(cap) = get_in_tx(tx, overlap.id)? {
            modified.push(cap);
        }
    } else {
        // Right overhang: trim the left side.
        set_extent(tx, recorder, overlap.id, "start_frame_index", end + 1)?;
        if let Some(cap) = get_in_tx(tx, overlap.id)? {
            modified.push(cap);
        }
    }
    Ok(())
}

/// Creates a gap caption over `[gap_start, gap_end]`, absorbing any caption
/// adjacent to it whose state is already `gap`.
fn create_or_merge_gap(
    tx: &rusqlite::Transaction,
    recorder: &mut ChangeRecorder,
    gap_start: i64,
    gap_end: i64,
) -> Result<Option<Caption>, Error> {
    let mut merged_start = gap_start;
    let mut merged_end = gap_end;
    let mut absorb = Vec::new();
    {
        let mut stmt = tx.prepare_cached(&format!(
            "select {CAPTION_COLS} from captions \
             where caption_frame_extents_state = 'gap' \
               and (end_frame_index = :before or start_frame_index = :after) \
             order by start_frame_index"
        ))?;
        let mut rows = stmt.query(named_params! {
            ":before": gap_start - 1,
            ":after": gap_end + 1,
        })?;
        while let Some(row) = rows.next()? {
            let gap = caption_from_row(row)?;
            if gap.end_frame_index == gap_start - 1 {
                merged_start = gap.start_frame_index;
                absorb.push(gap.id);
            } else if gap.start_frame_index == gap_end + 1 {
                merged_end = gap.end_frame_index;
                absorb.push(gap.id);
            }
        }
    }
    for id in absorb {
        tx.execute("delete from captions where id = ?", params![id])?;
        recorder.log_delete(tx, "captions", id)?;
    }
    let id = insert_caption(
        tx,
        recorder,
        &CaptionCreate {
            start_frame_index: merged_start,
            end_frame_index: merged_end,
            caption_frame_extents_state: ExtentsState::Gap,
            caption_frame_extents_pending: false,
            text: None,
        },
    )?;
    get_in_tx(tx, id)
}

/// Applies one batch operation; returns the affected id or a client-facing
/// failure message.
fn apply_batch_item(
    tx: &rusqlite::Transaction,
    recorder: &mut ChangeRecorder,
    item: &BatchItem,
) -> Result<i64, String> {
    match item.op {
        BatchOp::Create => {
            let Some(data) = &item.data else {
                return Err("Create operation requires 'data' field".to_owned());
            };
            let (Some(start), Some(end)) = (data.start_frame_index, data.end_frame_index) else {
                return Err("Invalid data for create operation".to_owned());
            };
            if start < 0 {
                return Err("startFrameIndex must be non-negative".to_owned());
            }
            if end <= start {
                return Err("endFrameIndex must be greater than startFrameIndex".to_owned());
            }
            let input = CaptionCreate {
                start_frame_index: start,
                end_frame_index: end,
                caption_frame_extents_state: data
                    .caption_frame_extents_state
                    .unwrap_or(ExtentsState::Predicted),
                caption_frame_extents_pending: false,
                text: data.text.clone(),
            };
            insert_caption(tx, recorder, &input).map_err(|e| e.to_string())
        }
        BatchOp::Update => {
            let Some(id) = item.id else {
                return Err("Update operation requires 'id' field".to_owned());
            };
            let Some(data) = &item.data else {
                return Err("Update operation requires 'data' field".to_owned());
            };
            let existing = get_in_tx(tx, id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("Caption {id} not found"))?;
            let start = data.start_frame_index.unwrap_or(existing.start_frame_index);
            let end = data.end_frame_index.unwrap_or(existing.end_frame_index);
            if start < 0 {
                return Err("startFrameIndex must be non-negative".to_owned());
            }
            if end <= start {
                return Err("endFrameIndex must be greater than startFrameIndex".to_owned());
            }
            update_simple(tx, recorder, id, data).map_err(|e| e.to_string())?;
            Ok(id)
        }
        BatchOp::Delete => {
            let Some(id) = item.id else {
                return Err("Delete operation requires 'id' field".to_owned());
            };
            let rows = tx
                .execute("delete from captions where id = ?", params![id])
                .map_err(|e| e.to_string())?;
            if rows == 0 {
                return Err(format!("Caption {id} not found"));
            }
            recorder
                .log_delete(tx, "captions", id)
                .map_err(|e| e.to_string())?;
            Ok(id)
        }
    }
}

/// Field-by-field update without overlap resolution, for batch operations
/// where the client computed the resolution.
fn update_simple(
    tx: &rusqlite::Transaction,
    recorder: &mut ChangeRecorder,
    id: i64,
    data: &BatchData,
) -> Result<(), Error> {
    let mut sets = Vec::new();
    let mut logged: Vec<(&str, Value)> = Vec::new();
    let mut sql_params: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = data.start_frame_index {
        sets.push("start_frame_index = ?");
        sql_params.push(v.into());
        logged.push(("start_frame_index", Value::from(v)));
    }
    if let Some(v) = data.end_frame_index {
        sets.push("end_frame_index = ?");
        sql_params.push(v.into());
        logged.push(("end_frame_index", Value::from(v)));
    }
    if let Some(v) = data.caption_frame_extents_state {
        sets.push("caption_frame_extents_state = ?");
        sql_params.push(v.as_str().to_owned().into());
        logged.push(("caption_frame_extents_state", Value::from(v.as_str())));
    }
    if let Some(v) = &data.text {
        sets.push("text = ?");
        sql_params.push(v.clone().into());
        logged.push(("text", Value::from(v.as_str())));
    }
    if let Some(v) = &data.text_status {
        sets.push("text_status = ?");
        sql_params.push(v.clone().into());
        logged.push(("text_status", Value::from(v.as_str())));
    }
    if let Some(v) = &data.text_notes {
        sets.push("text_notes = ?");
        sql_params.push(v.clone().into());
        logged.push(("text_notes", Value::from(v.as_str())));
    }
    if sets.is_empty() {
        return Ok(());
    }
    sets.push("caption_frame_extents_updated_at = datetime('now')");
    let sql = format!("update captions set {} where id = ?", sets.join(", "));
    sql_params.push(id.into());
    tx.execute(&sql, rusqlite::params_from_iter(sql_params))?;
    log_cols(recorder, tx, id, &logged)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatabaseName;
    use crate::testutil::TestHarness;
    use crate::workingcopy::Handle;
    use base::ErrorKind;

    async fn captions_handle(h: &TestHarness) -> Handle {
        h.copies
            .open_for_repo("t1", "v1", DatabaseName::Captions)
            .await
            .unwrap()
    }

    fn create(
        repo: &mut CaptionRepository,
        start: i64,
        end: i64,
        state: ExtentsState,
    ) -> Caption {
        repo.create(&CaptionCreate {
            start_frame_index: start,
            end_frame_index: end,
            caption_frame_extents_state: state,
            caption_frame_extents_pending: false,
            text: None,
        })
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn create_sets_regen_flag() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let confirmed = create(&mut repo, 0, 10, ExtentsState::Confirmed);
        assert!(confirmed.image_needs_regen);
        let gap = create(&mut repo, 11, 20, ExtentsState::Gap);
        assert!(!gap.image_needs_regen);
    }

    #[tokio::test]
    async fn overlap_resolution_scenario() {
        // Captions [0,100], [101,200], [201,300], [301,400], all confirmed.
        // Growing #1 to [50,350] deletes the contained rows, trims the last,
        // and opens a gap where #1 used to start.
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let c1 = create(&mut repo, 0, 100, ExtentsState::Confirmed);
        let c2 = create(&mut repo, 101, 200, ExtentsState::Confirmed);
        let c3 = create(&mut repo, 201, 300, ExtentsState::Confirmed);
        let c4 = create(&mut repo, 301, 400, ExtentsState::Confirmed);

        let r = repo
            .update_with_overlap_resolution(
                c1.id,
                &CaptionUpdate {
                    start_frame_index: 50,
                    end_frame_index: 350,
                    caption_frame_extents_state: ExtentsState::Confirmed,
                },
            )
            .unwrap();

        assert_eq!(r.caption.start_frame_index, 50);
        assert_eq!(r.caption.end_frame_index, 350);
        assert!(r.caption.image_needs_regen);
        assert!(!r.caption.caption_frame_extents_pending);

        let mut deleted = r.deleted_captions.clone();
        deleted.sort();
        assert_eq!(deleted, vec![c2.id, c3.id]);

        assert_eq!(r.modified_captions.len(), 1);
        let trimmed = &r.modified_captions[0];
        assert_eq!(trimmed.id, c4.id);
        assert_eq!(trimmed.start_frame_index, 351);
        assert_eq!(trimmed.end_frame_index, 400);
        assert!(trimmed.caption_frame_extents_pending);

        assert_eq!(r.created_gaps.len(), 1);
        assert_eq!(r.created_gaps[0].start_frame_index, 0);
        assert_eq!(r.created_gaps[0].end_frame_index, 49);
        assert_eq!(
            r.created_gaps[0].caption_frame_extents_state,
            ExtentsState::Gap
        );

        // Every mutation produced deltas for the sync layer.
        assert!(!r.deltas.is_empty());
    }

    #[tokio::test]
    async fn straddle_splits_into_two() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let big = create(&mut repo, 0, 100, ExtentsState::Confirmed);
        let target = create(&mut repo, 45, 55, ExtentsState::Predicted);

        let r = repo
            .update_with_overlap_resolution(
                target.id,
                &CaptionUpdate {
                    start_frame_index: 40,
                    end_frame_index: 60,
                    caption_frame_extents_state: ExtentsState::Confirmed,
                },
            )
            .unwrap();

        assert!(r.deleted_captions.is_empty());
        assert_eq!(r.modified_captions.len(), 2);
        let left = r
            .modified_captions
            .iter()
            .find(|c| c.id == big.id)
            .unwrap();
        assert_eq!((left.start_frame_index, left.end_frame_index), (0, 39));
        let right = r
            .modified_captions
            .iter()
            .find(|c| c.id != big.id)
            .unwrap();
        assert_eq!((right.start_frame_index, right.end_frame_index), (61, 100));
        assert_eq!(
            right.caption_frame_extents_state,
            ExtentsState::Confirmed
        );
        assert!(right.caption_frame_extents_pending);
    }

    #[tokio::test]
    async fn exact_extents_only_clears_pending() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let c = repo
            .create(&CaptionCreate {
                start_frame_index: 10,
                end_frame_index: 20,
                caption_frame_extents_state: ExtentsState::Predicted,
                caption_frame_extents_pending: true,
                text: None,
            })
            .unwrap()
            .0;
        let r = repo
            .update_with_overlap_resolution(
                c.id,
                &CaptionUpdate {
                    start_frame_index: 10,
                    end_frame_index: 20,
                    caption_frame_extents_state: ExtentsState::Confirmed,
                },
            )
            .unwrap();
        assert!(r.deleted_captions.is_empty());
        assert!(r.modified_captions.is_empty());
        assert!(r.created_gaps.is_empty());
        assert!(!r.caption.caption_frame_extents_pending);
        assert!(!r.caption.image_needs_regen);
    }

    #[tokio::test]
    async fn full_range_update_deletes_everything_else() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let c1 = create(&mut repo, 0, 100, ExtentsState::Confirmed);
        create(&mut repo, 101, 200, ExtentsState::Confirmed);
        create(&mut repo, 201, 299, ExtentsState::Gap);

        let r = repo
            .update_with_overlap_resolution(
                c1.id,
                &CaptionUpdate {
                    start_frame_index: 0,
                    end_frame_index: 299,
                    caption_frame_extents_state: ExtentsState::Confirmed,
                },
            )
            .unwrap();
        assert_eq!(r.deleted_captions.len(), 2);
        assert!(r.created_gaps.is_empty());
        assert_eq!(repo.list(None, None, false, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shrink_merges_adjacent_gap() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        create(&mut repo, 0, 49, ExtentsState::Gap);
        let c = create(&mut repo, 50, 100, ExtentsState::Confirmed);

        // Shrinking the left edge opens [50,59], which must be absorbed into
        // the existing [0,49] gap as a single [0,59] row.
        let r = repo
            .update_with_overlap_resolution(
                c.id,
                &CaptionUpdate {
                    start_frame_index: 60,
                    end_frame_index: 100,
                    caption_frame_extents_state: ExtentsState::Confirmed,
                },
            )
            .unwrap();
        assert_eq!(r.created_gaps.len(), 1);
        let gap = &r.created_gaps[0];
        assert_eq!((gap.start_frame_index, gap.end_frame_index), (0, 59));

        let all = repo.list(None, None, false, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].caption_frame_extents_state, ExtentsState::Gap);
        assert_eq!(
            (all[0].start_frame_index, all[0].end_frame_index),
            (0, 59)
        );
    }

    #[tokio::test]
    async fn workable_filter() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        create(&mut repo, 0, 10, ExtentsState::Confirmed);
        create(&mut repo, 11, 20, ExtentsState::Gap);
        let pending = repo
            .create(&CaptionCreate {
                start_frame_index: 21,
                end_frame_index: 30,
                caption_frame_extents_state: ExtentsState::Predicted,
                caption_frame_extents_pending: true,
                text: None,
            })
            .unwrap()
            .0;
        let workable = repo.list(None, None, true, None).unwrap();
        assert_eq!(workable.len(), 2);
        assert!(workable.iter().any(|c| c.id == pending.id));

        let limited = repo.list(None, None, true, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);

        let ranged = repo.list(Some(0), Some(15), false, None).unwrap();
        assert_eq!(ranged.len(), 2);
    }

    #[tokio::test]
    async fn text_update_clears_text_pending() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        {
            let conn = handle.conn_mut();
            conn.execute(
                "insert into captions (start_frame_index, end_frame_index, \
                 caption_frame_extents_state, text_pending) values (0, 10, 'confirmed', 1)",
                [],
            )
            .unwrap();
        }
        let mut repo = CaptionRepository::new(&mut handle);
        let (c, deltas) = repo
            .update_text(
                1,
                &CaptionTextUpdate {
                    text: Some("hello".to_owned()),
                    text_status: Some("final".to_owned()),
                    text_notes: None,
                },
            )
            .unwrap();
        assert_eq!(c.text.as_deref(), Some("hello"));
        assert!(!c.text_pending);
        assert!(c.text_updated_at.is_some());
        assert!(!deltas.is_empty());
    }

    #[tokio::test]
    async fn batch_rolls_back_on_missing_id() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        create(&mut repo, 0, 10, ExtentsState::Confirmed);

        let outcome = repo
            .batch(&[
                BatchItem {
                    op: BatchOp::Create,
                    id: None,
                    data: Some(BatchData {
                        start_frame_index: Some(11),
                        end_frame_index: Some(20),
                        ..Default::default()
                    }),
                },
                BatchItem {
                    op: BatchOp::Update,
                    id: Some(999),
                    data: Some(BatchData {
                        text: Some("x".to_owned()),
                        ..Default::default()
                    }),
                },
            ])
            .unwrap();

        let BatchOutcome::Failed(e) = outcome else {
            panic!("batch should have failed");
        };
        assert_eq!(e.index, 1);
        assert_eq!(e.op, BatchOp::Update);
        assert_eq!(e.message, "Caption 999 not found");

        // No side effects from the first operation.
        assert_eq!(repo.list(None, None, false, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_applies_in_order() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let victim = create(&mut repo, 0, 10, ExtentsState::Confirmed);

        let outcome = repo
            .batch(&[
                BatchItem {
                    op: BatchOp::Delete,
                    id: Some(victim.id),
                    data: None,
                },
                BatchItem {
                    op: BatchOp::Create,
                    id: None,
                    data: Some(BatchData {
                        start_frame_index: Some(0),
                        end_frame_index: Some(5),
                        caption_frame_extents_state: Some(ExtentsState::Confirmed),
                        ..Default::default()
                    }),
                },
            ])
            .unwrap();
        let BatchOutcome::Applied { results, deltas } = outcome else {
            panic!("batch should have applied");
        };
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].op, BatchOp::Delete);
        assert!(!deltas.is_empty());
        let all = repo.list(None, None, false, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].end_frame_index, 5);
    }

    #[tokio::test]
    async fn batch_validates_frame_indices() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let outcome = repo
            .batch(&[BatchItem {
                op: BatchOp::Create,
                id: None,
                data: Some(BatchData {
                    start_frame_index: Some(10),
                    end_frame_index: Some(10),
                    ..Default::default()
                }),
            }])
            .unwrap();
        let BatchOutcome::Failed(e) = outcome else {
            panic!("batch should have failed");
        };
        assert_eq!(e.index, 0);
        assert_eq!(
            e.message,
            "endFrameIndex must be greater than startFrameIndex"
        );
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let h = TestHarness::new().await;
        let mut handle = captions_handle(&h).await;
        let mut repo = CaptionRepository::new(&mut handle);
        let e = repo.delete(42).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}
