// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The working-copy store: one locally materialized CRDT-SQLite file per
//! `(tenant, video, database)`.
//!
//! Each copy carries a `crdt_changes` log alongside the domain tables.
//! Inbound row deltas are recorded verbatim and applied last-writer-wins
//! (greater `column_version` wins; ties break on `site_id`). Deltas whose
//! `(site_id, db_version, sequence, table, primary_key, column_id)` have
//! been seen before are suppressed. Only the `captions` table is
//! materialized server-side; deltas against other tables (e.g. the
//! client-defined layout schema) flow through the log untouched.
//!
//! Writes to one file are serialized through a per-path async mutex. The
//! registry's server/client lock is what makes that mutex unique across the
//! cluster; see the concurrency notes in `DESIGN.md`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap};
use rusqlite::{named_params, params, OptionalExtension as _};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::object::{ObjectKey, ObjectStore, UploadBody};
use crate::registry::{DatabaseName, Registry};

/// A single CRDT mutation, carried verbatim between peers. Everything
/// outside this module treats it as opaque bytes plus indexing fields.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RowDelta {
    pub table: String,
    pub primary_key: Value,
    pub column_id: String,
    pub value: Value,
    pub column_version: i64,
    pub db_version: i64,
    pub site_id: String,
    pub causal_length: i64,
    pub sequence: i64,
}

/// Per-site high-water marks, as reported by a peer asking for a catch-up.
pub type VersionVector = BTreeMap<String, i64>;

/// Sentinel `column_id` marking row existence changes; an even
/// `causal_length` means the row is deleted.
pub const SENTINEL_COLUMN: &str = "-1";

/// Columns of the `captions` table that deltas may address. Anything else
/// is logged but not materialized.
const CAPTION_COLUMNS: &[&str] = &[
    "start_frame_index",
    "end_frame_index",
    "caption_frame_extents_state",
    "caption_frame_extents_pending",
    "caption_frame_extents_updated_at",
    "text",
    "text_pending",
    "text_status",
    "text_notes",
    "caption_ocr",
    "caption_ocr_status",
    "caption_ocr_error",
    "caption_ocr_processed_at",
    "text_updated_at",
    "image_needs_regen",
];

const CRDT_SCHEMA: &str = r#"
    create table if not exists crdt_meta (
      key text primary key,
      value text not null
    );
    create table if not exists crdt_changes (
      tbl text not null,
      pk text not null,
      cid text not null,
      val text,
      col_version integer not null,
      db_version integer not null,
      site_id text not null,
      causal_length integer not null,
      seq integer not null,
      local_version integer not null,
      primary key (site_id, db_version, seq, tbl, pk, cid)
    );
    create index if not exists crdt_changes_local on crdt_changes (local_version);
"#;

const CAPTIONS_SCHEMA: &str = r#"
    create table if not exists captions (
      id integer primary key autoincrement,
      start_frame_index integer not null default 0,
      end_frame_index integer not null default 0,
      caption_frame_extents_state text not null default 'predicted',
      caption_frame_extents_pending integer not null default 0,
      caption_frame_extents_updated_at text,
      text text,
      text_pending integer not null default 0,
      text_status text,
      text_notes text,
      caption_ocr text,
      caption_ocr_status text,
      caption_ocr_error text,
      caption_ocr_processed_at text,
      text_updated_at text,
      image_needs_regen integer not null default 0,
      created_at text not null default (datetime('now'))
    );
    create index if not exists captions_by_start on captions (start_frame_index);
"#;

/// Manager of all working copies under one local directory.
pub struct WorkingCopies<C: Clocks + Clone> {
    dir: PathBuf,
    registry: Arc<Registry<C>>,
    store: Arc<dyn ObjectStore>,
    file_locks: base::Mutex<FastHashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: Clocks + Clone> WorkingCopies<C> {
    pub fn new(
        dir: PathBuf,
        registry: Arc<Registry<C>>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| err!(Unavailable, msg("unable to create {}", dir.display()), source(e)))?;
        Ok(WorkingCopies {
            dir,
            registry,
            store,
            file_locks: base::Mutex::new(FastHashMap::default()),
        })
    }

    pub fn path_for(&self, tenant_id: &str, video_id: &str, db: DatabaseName) -> PathBuf {
        self.dir
            .join(tenant_id)
            .join(video_id)
            .join(format!("{}.db", db.as_str()))
    }

    fn file_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.file_locks.lock();
        locks
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn has_working_copy(&self, tenant_id: &str, video_id: &str, db: DatabaseName) -> bool {
        self.path_for(tenant_id, video_id, db).is_file()
    }

    /// Fetches the latest persisted blob from the object store and installs
    /// it at the working path. Fails with `NotFound` if no blob exists yet.
    pub async fn download_from_store(
        &self,
        tenant_id: &str,
        video_id: &str,
        db: DatabaseName,
    ) -> Result<(), Error> {
        let path = self.path_for(tenant_id, video_id, db);
        let lock = self.file_lock(&path);
        let _guard = lock.lock_owned().await;
        let key = ObjectKey::database(tenant_id, video_id, db);
        let gz_path = path.with_extension("db.gz.partial");
        self.store.download(&key, &gz_path).await?;
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let tmp = path.with_extension("db.partial");
            {
                let gz = std::fs::File::open(&gz_path)?;
                let mut decoder = flate2::read::GzDecoder::new(gz);
                let mut out = std::fs::File::create(&tmp)?;
                std::io::copy(&mut decoder, &mut out)?;
                out.sync_all()?;
            }
            std::fs::rename(&tmp, &path)?;
            let _ = std::fs::remove_file(&gz_path);
            Ok(())
        })
        .await
        .map_err(|e| err!(Internal, msg("install task panicked"), source(e)))??;
        info!("installed working copy for {tenant_id}/{video_id}/{db}");
        Ok(())
    }

    /// Gzips and uploads the working copy, returning the `server_version`
    /// snapshot captured before the file was read. The caller advances
    /// `wasabi_version` to this value once the upload has succeeded.
    pub async fn upload_to_store(
        &self,
        tenant_id: &str,
        video_id: &str,
        db: DatabaseName,
    ) -> Result<u64, Error> {
        let snapshot = self
            .registry
            .lock()
            .get_state(video_id, db)?
            .map(|s| s.server_version)
            .unwrap_or(0);
        let path = self.path_for(tenant_id, video_id, db);
        let lock = self.file_lock(&path);
        let gz = {
            let _guard = lock.lock_owned().await;
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
                let mut raw = Vec::new();
                std::fs::File::open(&path)
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::NotFound => {
                            err!(NotFound, msg("no working copy at {}", path.display()))
                        }
                        _ => e.into(),
                    })?
                    .read_to_end(&mut raw)?;
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&raw)?;
                Ok(encoder.finish()?)
            })
            .await
            .map_err(|e| err!(Internal, msg("gzip task panicked"), source(e)))??
        };
        let key = ObjectKey::database(tenant_id, video_id, db);
        self.store
            .upload(&key, UploadBody::Bytes(gz), "application/gzip")
            .await?;
        debug!("uploaded {tenant_id}/{video_id}/{db} at version {snapshot}");
        Ok(snapshot)
    }

    /// Deletes the local file, e.g. after the lock moved to another node.
    pub async fn remove_working_copy(
        &self,
        tenant_id: &str,
        video_id: &str,
        db: DatabaseName,
    ) -> Result<(), Error> {
        let path = self.path_for(tenant_id, video_id, db);
        let lock = self.file_lock(&path);
        let _guard = lock.lock_owned().await;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies row deltas and bumps the registry's `server_version`,
    /// returning the new version.
    pub async fn apply_changes(
        &self,
        tenant_id: &str,
        video_id: &str,
        db: DatabaseName,
        changes: &[RowDelta],
    ) -> Result<u64, Error> {
        let path = self.path_for(tenant_id, video_id, db);
        let lock = self.file_lock(&path);
        {
            let _guard = lock.lock_owned().await;
            let changes = changes.to_vec();
            tokio::task::spawn_blocking(move || -> Result<(), Error> {
                let mut conn = open_copy(&path, db)?;
                let tx = conn.transaction()?;
                let mut local_version = meta_i64(&tx, "local_version")?;
                for delta in &changes {
                    local_version += 1;
                    apply_one(&tx, delta, local_version)?;
                }
                meta_set(&tx, "local_version", &local_version.to_string())?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| err!(Internal, msg("apply task panicked"), source(e)))??;
        }
        let new_version = {
            let mut registry = self.registry.lock();
            registry.get_or_create_state(video_id, db, tenant_id)?;
            registry.increment_server_version(video_id, db)?
        };
        Ok(new_version)
    }

    /// Returns the deltas the peer is missing, in local apply order.
    pub async fn pull_changes_since(
        &self,
        tenant_id: &str,
        video_id: &str,
        db: DatabaseName,
        peer: &VersionVector,
    ) -> Result<Vec<RowDelta>, Error> {
        let path = self.path_for(tenant_id, video_id, db);
        let lock = self.file_lock(&path);
        let _guard = lock.lock_owned().await;
        let peer = peer.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<RowDelta>, Error> {
            let conn = open_copy_readonly(&path, db)?;
            let mut stmt = conn.prepare_cached(
                "select tbl, pk, cid, val, col_version, db_version, site_id, causal_length, seq \
                 from crdt_changes order by local_version",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let delta = delta_from_row(row)?;
                let seen = peer.get(&delta.site_id).copied().unwrap_or(0);
                if delta.db_version > seen {
                    out.push(delta);
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| err!(Internal, msg("pull task panicked"), source(e)))?
    }

    /// Opens the working copy for domain (SQL-level) access by the caption
    /// repository, holding the per-file write lock for the handle's
    /// lifetime. File-level resources are released on all exit paths via
    /// `Drop`.
    pub async fn open_for_repo(
        &self,
        tenant_id: &str,
        video_id: &str,
        db: DatabaseName,
    ) -> Result<Handle, Error> {
        let path = self.path_for(tenant_id, video_id, db);
        let lock = self.file_lock(&path);
        let guard = lock.lock_owned().await;
        let conn = open_copy(&path, db)?;
        Ok(Handle {
            conn,
            _guard: guard,
        })
    }
}

/// A scoped handle exposing SQL-level access to one working copy.
pub struct Handle {
    conn: rusqlite::Connection,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Handle {
    pub(crate) fn conn_mut(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }
}

/// Records local (server-originated) mutations into the change log within
/// an open transaction, so they replicate to peers like any other deltas.
pub struct ChangeRecorder {
    site_id: String,
    db_version: i64,
    local_version: i64,
    seq: i64,
    recorded: Vec<RowDelta>,
}

impl ChangeRecorder {
    /// Allocates the next `db_version` for this site. Counter writes land
    /// when `finish` runs inside the same transaction.
    pub fn begin(tx: &rusqlite::Transaction) -> Result<Self, Error> {
        let site_id = meta_get(tx, "site_id")?
            .ok_or_else(|| err!(Internal, msg("working copy has no site id")))?;
        let db_version = meta_i64(tx, "db_version")? + 1;
        let local_version = meta_i64(tx, "local_version")?;
        Ok(ChangeRecorder {
            site_id,
            db_version,
            local_version,
            seq: 0,
            recorded: Vec::new(),
        })
    }

    /// Logs a column write on `(table, pk)`.
    pub fn log(
        &mut self,
        tx: &rusqlite::Transaction,
        table: &str,
        pk: i64,
        column_id: &str,
        value: Value,
    ) -> Result<(), Error> {
        let col_version = current_column_version(tx, table, pk, column_id)? + 1;
        let causal_length = current_causal_length(tx, table, pk)?.max(1);
        self.push(tx, table, pk, column_id, value, col_version, causal_length)
    }

    /// Logs row creation (odd causal length).
    pub fn log_create(
        &mut self,
        tx: &rusqlite::Transaction,
        table: &str,
        pk: i64,
    ) -> Result<(), Error> {
        let mut cl = current_causal_length(tx, table, pk)?;
        if cl % 2 != 0 && cl > 0 {
            return Ok(()); // already alive
        }
        cl += 1;
        let col_version = current_column_version(tx, table, pk, SENTINEL_COLUMN)? + 1;
        self.push(tx, table, pk, SENTINEL_COLUMN, Value::Null, col_version, cl)
    }

    /// Logs row deletion (even causal length).
    pub fn log_delete(
        &mut self,
        tx: &rusqlite::Transaction,
        table: &str,
        pk: i64,
    ) -> Result<(), Error> {
        let mut cl = current_causal_length(tx, table, pk)?;
        if cl % 2 == 0 && cl > 0 {
            return Ok(()); // already deleted
        }
        cl = cl.max(1) + 1;
        let col_version = current_column_version(tx, table, pk, SENTINEL_COLUMN)? + 1;
        self.push(tx, table, pk, SENTINEL_COLUMN, Value::Null, col_version, cl)
    }

    fn push(
        &mut self,
        tx: &rusqlite::Transaction,
        table: &str,
        pk: i64,
        column_id: &str,
        value: Value,
        col_version: i64,
        causal_length: i64,
    ) -> Result<(), Error> {
        self.seq += 1;
        self.local_version += 1;
        let delta = RowDelta {
            table: table.to_owned(),
            primary_key: Value::from(pk),
            column_id: column_id.to_owned(),
            value,
            column_version: col_version,
            db_version: self.db_version,
            site_id: self.site_id.clone(),
            causal_length,
            sequence: self.seq,
        };
        insert_change(tx, &delta, self.local_version)?;
        self.recorded.push(delta);
        Ok(())
    }

    /// Persists the version counters and returns the deltas recorded, for
    /// broadcast to connected peers.
    pub fn finish(self, tx: &rusqlite::Transaction) -> Result<Vec<RowDelta>, Error> {
        meta_set(tx, "db_version", &self.db_version.to_string())?;
        meta_set(tx, "local_version", &self.local_version.to_string())?;
        Ok(self.recorded)
    }
}

fn open_copy(path: &Path, db: DatabaseName) -> Result<rusqlite::Connection, Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch("pragma journal_mode = wal; pragma foreign_keys = on;")?;
    conn.execute_batch(CRDT_SCHEMA)?;
    if db == DatabaseName::Captions {
        conn.execute_batch(CAPTIONS_SCHEMA)?;
    }
    let site: Option<String> =
        conn.query_row("select value from crdt_meta where key = 'site_id'", [], |r| {
            r.get(0)
        })
        .optional()?;
    if site.is_none() {
        conn.execute(
            "insert into crdt_meta (key, value) values ('site_id', ?)",
            params![Uuid::new_v4().to_string()],
        )?;
    }
    Ok(conn)
}

fn open_copy_readonly(path: &Path, db: DatabaseName) -> Result<rusqlite::Connection, Error> {
    if !path.is_file() {
        bail!(NotFound, msg("no working copy at {}", path.display()));
    }
    open_copy(path, db)
}

fn meta_get(conn: &rusqlite::Connection, key: &str) -> Result<Option<String>, Error> {
    Ok(conn
        .query_row(
            "select value from crdt_meta where key = ?",
            params![key],
            |r| r.get(0),
        )
        .optional()?)
}

fn meta_i64(conn: &rusqlite::Connection, key: &str) -> Result<i64, Error> {
    Ok(meta_get(conn, key)?
        .map(|v| v.parse::<i64>())
        .transpose()
        .map_err(|e| err!(DataLoss, msg("corrupt crdt_meta {key}"), source(e)))?
        .unwrap_or(0))
}

fn meta_set(conn: &rusqlite::Connection, key: &str, value: &str) -> Result<(), Error> {
    conn.execute(
        "insert into crdt_meta (key, value) values (?, ?) \
         on conflict (key) do update set value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn pk_text(pk: &Value) -> String {
    match pk {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn delta_from_row(row: &rusqlite::Row) -> rusqlite::Result<RowDelta> {
    let pk: String = row.get(1)?;
    let val: Option<String> = row.get(3)?;
    Ok(RowDelta {
        table: row.get(0)?,
        primary_key: pk
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(pk)),
        column_id: row.get(2)?,
        value: val
            .map(|v| serde_json::from_str(&v).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        column_version: row.get(4)?,
        db_version: row.get(5)?,
        site_id: row.get(6)?,
        causal_length: row.get(7)?,
        sequence: row.get(8)?,
    })
}

fn insert_change(
    tx: &rusqlite::Transaction,
    delta: &RowDelta,
    local_version: i64,
) -> Result<bool, Error> {
    let mut stmt = tx.prepare_cached(
        "insert into crdt_changes \
         (tbl, pk, cid, val, col_version, db_version, site_id, causal_length, seq, local_version) \
         values (:tbl, :pk, :cid, :val, :col_version, :db_version, :site_id, :causal_length, \
                 :seq, :local_version) \
         on conflict do nothing",
    )?;
    let rows = stmt.execute(named_params! {
        ":tbl": delta.table,
        ":pk": pk_text(&delta.primary_key),
        ":cid": delta.column_id,
        ":val": serde_json::to_string(&delta.value)?,
        ":col_version": delta.column_version,
        ":db_version": delta.db_version,
        ":site_id": delta.site_id,
        ":causal_length": delta.causal_length,
        ":seq": delta.sequence,
        ":local_version": local_version,
    })?;
    Ok(rows > 0)
}

fn current_column_version(
    tx: &rusqlite::Transaction,
    table: &str,
    pk: i64,
    column_id: &str,
) -> Result<i64, Error> {
    let mut stmt = tx.prepare_cached(
        "select coalesce(max(col_version), 0) from crdt_changes \
         where tbl = :tbl and pk = :pk and cid = :cid",
    )?;
    Ok(stmt.query_row(
        named_params! {":tbl": table, ":pk": pk.to_string(), ":cid": column_id},
        |r| r.get(0),
    )?)
}

fn current_causal_length(tx: &rusqlite::Transaction, table: &str, pk: i64) -> Result<i64, Error> {
    let mut stmt = tx.prepare_cached(
        "select coalesce(max(causal_length), 0) from crdt_changes \
         where tbl = :tbl and pk = :pk and cid = :cid",
    )?;
    Ok(stmt.query_row(
        named_params! {":tbl": table, ":pk": pk.to_string(), ":cid": SENTINEL_COLUMN},
        |r| r.get(0),
    )?)
}

/// Applies one inbound delta: dedup, log, and (if it wins LWW) materialize.
/// Returns whether the delta was newly applied.
fn apply_one(
    tx: &rusqlite::Transaction,
    delta: &RowDelta,
    local_version: i64,
) -> Result<bool, Error> {
    // Current winner before we log the new change.
    let mut stmt = tx.prepare_cached(
        "select col_version, site_id from crdt_changes \
         where tbl = :tbl and pk = :pk and cid = :cid \
         order by col_version desc, site_id desc limit 1",
    )?;
    let current: Option<(i64, String)> = stmt
        .query_row(
            named_params! {
                ":tbl": delta.table,
                ":pk": pk_text(&delta.primary_key),
                ":cid": delta.column_id,
            },
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    if !insert_change(tx, delta, local_version)? {
        return Ok(false); // duplicate; suppressed.
    }

    let wins = match current {
        None => true,
        Some((cv, sid)) => {
            delta.column_version > cv || (delta.column_version == cv && delta.site_id > sid)
        }
    };
    if wins {
        materialize(tx, delta)?;
    }
    Ok(true)
}

/// Reflects a winning delta into the domain tables. Only `captions` is
/// interpreted here; other tables live entirely in the change log.
fn materialize(tx: &rusqlite::Transaction, delta: &RowDelta) -> Result<(), Error> {
    if delta.table != "captions" {
        return Ok(());
    }
    let Some(pk) = delta.primary_key.as_i64() else {
        bail!(
            InvalidArgument,
            msg("caption delta has non-integer primary key {:?}", delta.primary_key)
        );
    };
    if delta.column_id == SENTINEL_COLUMN {
        if delta.causal_length % 2 == 0 {
            tx.execute("delete from captions where id = ?", params![pk])?;
        } else {
            tx.execute(
                "insert or ignore into captions (id) values (?)",
                params![pk],
            )?;
        }
        return Ok(());
    }
    if !CAPTION_COLUMNS.contains(&delta.column_id.as_str()) {
        // Unknown column; keep it in the log only.
        return Ok(());
    }
    tx.execute(
        "insert or ignore into captions (id) values (?)",
        params![pk],
    )?;
    // Column name is allowlisted above, so splicing it is safe.
    let sql = format!("update captions set {} = ? where id = ?", delta.column_id);
    tx.execute(&sql, params![value_to_sql(&delta.value), pk])?;
    Ok(())
}
