// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The coordination registry: one SQLite database holding the canonical
//! per-`(video, database)` state rows, the video records, the frameset
//! version registry, and the access tokens.
//!
//! The [`Registry`] wrapper serializes access through a process-wide mutex;
//! lock acquisition additionally uses conditional `update ... where`
//! statements so that the row itself is the compare-and-set token. Those
//! conditional writes are the only operations that rely on the store's CAS
//! primitive; everything else is a plain write (see the concurrency notes in
//! `DESIGN.md`).

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use base::clock::{self, Clocks};
use base::{bail, err, Error};
use jiff::Timestamp;
use rusqlite::{named_params, params};
use tracing::info;
use uuid::Uuid;

/// Expected schema version; see `schema.sql`.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

/// The annotation databases a video carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseName {
    Layout,
    Captions,
}

pub const NUM_DATABASES: usize = 2;

impl DatabaseName {
    pub const ALL: [DatabaseName; NUM_DATABASES] = [DatabaseName::Layout, DatabaseName::Captions];

    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseName::Layout => "layout",
            DatabaseName::Captions => "captions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "layout" => Some(DatabaseName::Layout),
            "captions" => Some(DatabaseName::Captions),
            _ => None,
        }
    }
}

impl std::fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    None,
    Client,
    Server,
}

impl LockType {
    fn as_sql(self) -> Option<&'static str> {
        match self {
            LockType::None => None,
            LockType::Client => Some("client"),
            LockType::Server => Some("server"),
        }
    }

    fn from_sql(v: Option<&str>) -> Result<Self, Error> {
        match v {
            None => Ok(LockType::None),
            Some("client") => Ok(LockType::Client),
            Some("server") => Ok(LockType::Server),
            Some(o) => Err(err!(DataLoss, msg("unknown lock_type {o:?} in registry"))),
        }
    }
}

/// One coordination row. A missing row in the store is semantically equal to
/// [`DatabaseState::absent`].
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseState {
    pub video_id: String,
    pub database_name: DatabaseName,
    pub tenant_id: String,
    pub server_version: u64,
    pub wasabi_version: u64,
    pub lock_type: LockType,
    pub lock_holder_user_id: Option<String>,
    pub active_connection_id: Option<String>,
    pub locked_at: Option<Timestamp>,
    pub last_activity_at: Option<Timestamp>,
    pub wasabi_synced_at: Option<Timestamp>,
}

impl DatabaseState {
    /// The state implied by a missing row.
    pub fn absent(video_id: &str, database_name: DatabaseName, tenant_id: &str) -> Self {
        DatabaseState {
            video_id: video_id.to_owned(),
            database_name,
            tenant_id: tenant_id.to_owned(),
            server_version: 0,
            wasabi_version: 0,
            lock_type: LockType::None,
            lock_holder_user_id: None,
            active_connection_id: None,
            locked_at: None,
            last_activity_at: None,
            wasabi_synced_at: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.server_version > self.wasabi_version
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }

    fn from_sql(v: &str) -> Result<Self, Error> {
        match v {
            "pending" => Ok(VideoStatus::Pending),
            "processing" => Ok(VideoStatus::Processing),
            "ready" => Ok(VideoStatus::Ready),
            "failed" => Ok(VideoStatus::Failed),
            o => Err(err!(DataLoss, msg("unknown video status {o:?} in registry"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Video {
    pub id: String,
    pub tenant_id: String,
    pub title: Option<String>,
    pub storage_key: String,
    pub status: VideoStatus,
    pub duration_frames: Option<i64>,
    pub frame_rate: Option<f64>,
    pub current_frameset_version: Option<u32>,
    pub created_at: Timestamp,
}

/// Fields supplied when registering a video (from the inbound webhook).
#[derive(Clone, Debug)]
pub struct VideoChange {
    pub id: String,
    pub tenant_id: String,
    pub title: Option<String>,
    pub storage_key: String,
}

pub(crate) fn to_micros(t: Timestamp) -> i64 {
    t.as_microsecond()
}

pub(crate) fn from_micros(v: i64) -> Result<Timestamp, rusqlite::Error> {
    Timestamp::from_microsecond(v).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn opt_from_micros(v: Option<i64>) -> Result<Option<Timestamp>, rusqlite::Error> {
    v.map(from_micros).transpose()
}

/// Initializes a fresh registry database. Idempotence is the caller's
/// concern; applying to a non-empty database is an error.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))?;
    tx.execute(
        "insert into meta (uuid, schema_version) values (?, ?)",
        params![Uuid::new_v4().as_bytes().as_slice(), EXPECTED_SCHEMA_VERSION],
    )?;
    tx.commit()?;
    Ok(())
}

/// The registry with its lock held; all operations live here.
pub struct LockedRegistry<C: Clocks + Clone = clock::RealClocks> {
    conn: rusqlite::Connection,
    clocks: C,
}

/// The coordination registry; see the module doc.
pub struct Registry<C: Clocks + Clone = clock::RealClocks> {
    clocks: C,
    inner: base::Mutex<LockedRegistry<C>>,
}

pub struct RegistryGuard<'a, C: Clocks + Clone>(std::sync::MutexGuard<'a, LockedRegistry<C>>);

impl<'a, C: Clocks + Clone> Deref for RegistryGuard<'a, C> {
    type Target = LockedRegistry<C>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, C: Clocks + Clone> DerefMut for RegistryGuard<'a, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<C: Clocks + Clone> Registry<C> {
    pub fn new(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        {
            let ver: i32 = conn
                .query_row("select max(schema_version) from meta", [], |row| row.get(0))
                .map_err(|e| {
                    err!(
                        FailedPrecondition,
                        msg("registry database is uninitialized; run `capsync init`"),
                        source(e)
                    )
                })?;
            if ver != EXPECTED_SCHEMA_VERSION {
                bail!(
                    FailedPrecondition,
                    msg("registry schema version {ver} doesn't match expected {EXPECTED_SCHEMA_VERSION}")
                );
            }
        }
        conn.execute_batch("pragma journal_mode = wal; pragma foreign_keys = on;")?;
        info!("registry is loaded");
        Ok(Registry {
            clocks: clocks.clone(),
            inner: base::Mutex::new(LockedRegistry { conn, clocks }),
        })
    }

    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    pub fn lock(&self) -> RegistryGuard<'_, C> {
        RegistryGuard(self.inner.lock())
    }
}

const STATE_COLS: &str = "video_id, database_name, tenant_id, server_version, wasabi_version, \
     lock_type, lock_holder_user_id, active_connection_id, locked_at, last_activity_at, \
     wasabi_synced_at";

fn state_from_row(row: &rusqlite::Row) -> rusqlite::Result<DatabaseState> {
    let database_name: String = row.get(1)?;
    let lock_type: Option<String> = row.get(5)?;
    Ok(DatabaseState {
        video_id: row.get(0)?,
        database_name: DatabaseName::parse(&database_name).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown database name {database_name:?}").into(),
            )
        })?,
        tenant_id: row.get(2)?,
        server_version: row.get::<_, i64>(3)? as u64,
        wasabi_version: row.get::<_, i64>(4)? as u64,
        lock_type: LockType::from_sql(lock_type.as_deref()).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                "unknown lock type".into(),
            )
        })?,
        lock_holder_user_id: row.get(6)?,
        active_connection_id: row.get(7)?,
        locked_at: opt_from_micros(row.get(8)?)?,
        last_activity_at: opt_from_micros(row.get(9)?)?,
        wasabi_synced_at: opt_from_micros(row.get(10)?)?,
    })
}

impl<C: Clocks + Clone> LockedRegistry<C> {
    pub(crate) fn conn(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clocks.realtime()
    }

    pub fn get_state(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
    ) -> Result<Option<DatabaseState>, Error> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select {STATE_COLS} from database_state \
             where video_id = :video_id and database_name = :database_name"
        ))?;
        let mut rows = stmt.query(named_params! {
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(state_from_row(row)?)),
        }
    }

    /// Creates the row with zero versions and no lock if missing.
    pub fn get_or_create_state(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
        tenant_id: &str,
    ) -> Result<DatabaseState, Error> {
        let mut stmt = self.conn.prepare_cached(
            "insert into database_state (video_id, database_name, tenant_id) \
             values (:video_id, :database_name, :tenant_id) \
             on conflict (video_id, database_name) do nothing",
        )?;
        stmt.execute(named_params! {
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
            ":tenant_id": tenant_id,
        })?;
        drop(stmt);
        self.get_state(video_id, database_name)?
            .ok_or_else(|| err!(Internal, msg("state row vanished after upsert")))
    }

    /// Conditionally takes (or re-takes) the client lock: succeeds iff the
    /// row is unlocked or already held by `user_id` (session hand-off).
    /// Returns the post-acquisition state.
    pub fn acquire_client_lock(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
        user_id: &str,
        connection_id: &str,
        tenant_id: &str,
    ) -> Result<DatabaseState, Error> {
        self.get_or_create_state(video_id, database_name, tenant_id)?;
        let now = to_micros(self.now());
        let mut stmt = self.conn.prepare_cached(
            "update database_state \
             set lock_type = 'client', \
                 lock_holder_user_id = :user_id, \
                 active_connection_id = :connection_id, \
                 locked_at = :now \
             where video_id = :video_id and database_name = :database_name \
               and (lock_type is null \
                    or (lock_type = 'client' and lock_holder_user_id = :user_id))",
        )?;
        let rows = stmt.execute(named_params! {
            ":user_id": user_id,
            ":connection_id": connection_id,
            ":now": now,
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        drop(stmt);
        if rows == 0 {
            let state = self
                .get_state(video_id, database_name)?
                .ok_or_else(|| err!(Internal, msg("state row vanished during acquisition")))?;
            bail!(
                FailedPrecondition,
                msg(
                    "lock on {video_id}/{database_name} is held ({:?} by {:?})",
                    state.lock_type,
                    state.lock_holder_user_id,
                )
            );
        }
        self.get_state(video_id, database_name)?
            .ok_or_else(|| err!(Internal, msg("state row vanished during acquisition")))
    }

    /// Conditionally takes the server lock: succeeds iff the row exists and
    /// is unlocked. Returns whether the lock was taken.
    pub fn acquire_server_lock(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
        user_id: Option<&str>,
    ) -> Result<bool, Error> {
        let now = to_micros(self.now());
        let mut stmt = self.conn.prepare_cached(
            "update database_state \
             set lock_type = 'server', \
                 lock_holder_user_id = :user_id, \
                 active_connection_id = null, \
                 locked_at = :now \
             where video_id = :video_id and database_name = :database_name \
               and lock_type is null",
        )?;
        let rows = stmt.execute(named_params! {
            ":user_id": user_id,
            ":now": now,
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        Ok(rows > 0)
    }

    pub fn release_lock(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
    ) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(
            "update database_state \
             set lock_type = null, lock_holder_user_id = null, \
                 active_connection_id = null, locked_at = null \
             where video_id = :video_id and database_name = :database_name",
        )?;
        stmt.execute(named_params! {
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        Ok(())
    }

    /// Releases a client lock only if `connection_id` is still the bound
    /// connection, so a closing session can't clobber its hand-off successor.
    pub fn release_lock_if_connection(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
        connection_id: &str,
    ) -> Result<bool, Error> {
        let mut stmt = self.conn.prepare_cached(
            "update database_state \
             set lock_type = null, lock_holder_user_id = null, \
                 active_connection_id = null, locked_at = null \
             where video_id = :video_id and database_name = :database_name \
               and lock_type = 'client' and active_connection_id = :connection_id",
        )?;
        let rows = stmt.execute(named_params! {
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
            ":connection_id": connection_id,
        })?;
        Ok(rows > 0)
    }

    /// Atomic +1 on `server_version`; also refreshes `last_activity_at`.
    pub fn increment_server_version(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
    ) -> Result<u64, Error> {
        let now = to_micros(self.now());
        let mut stmt = self.conn.prepare_cached(
            "update database_state \
             set server_version = server_version + 1, last_activity_at = :now \
             where video_id = :video_id and database_name = :database_name",
        )?;
        let rows = stmt.execute(named_params! {
            ":now": now,
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no state row for {video_id}/{database_name}"));
        }
        let mut stmt = self.conn.prepare_cached(
            "select server_version from database_state \
             where video_id = :video_id and database_name = :database_name",
        )?;
        let v: i64 = stmt.query_row(
            named_params! {
                ":video_id": video_id,
                ":database_name": database_name.as_str(),
            },
            |row| row.get(0),
        )?;
        Ok(v as u64)
    }

    pub fn touch_activity(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
    ) -> Result<(), Error> {
        let now = to_micros(self.now());
        let mut stmt = self.conn.prepare_cached(
            "update database_state set last_activity_at = :now \
             where video_id = :video_id and database_name = :database_name",
        )?;
        stmt.execute(named_params! {
            ":now": now,
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        Ok(())
    }

    /// Sets `wasabi_version = max(wasabi_version, version)`; never regresses.
    pub fn advance_wasabi_version(
        &mut self,
        video_id: &str,
        database_name: DatabaseName,
        version: u64,
        at: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(
            "update database_state \
             set wasabi_version = max(wasabi_version, :version), wasabi_synced_at = :at \
             where video_id = :video_id and database_name = :database_name",
        )?;
        let rows = stmt.execute(named_params! {
            ":version": version as i64,
            ":at": to_micros(at),
            ":video_id": video_id,
            ":database_name": database_name.as_str(),
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no state row for {video_id}/{database_name}"));
        }
        Ok(())
    }

    /// Dirty rows past the idle or hard-checkpoint threshold. A row that has
    /// never synced counts as infinitely far past the checkpoint threshold;
    /// the caller's server-lock acquisition is what protects in-flight edits.
    pub fn list_pending_uploads(
        &mut self,
        idle: Duration,
        checkpoint: Duration,
    ) -> Result<Vec<DatabaseState>, Error> {
        let now = self.now();
        let idle_cutoff = to_micros(now) - idle.as_micros() as i64;
        let checkpoint_cutoff = to_micros(now) - checkpoint.as_micros() as i64;
        let mut stmt = self.conn.prepare_cached(&format!(
            "select {STATE_COLS} from database_state \
             where server_version > wasabi_version \
               and (coalesce(last_activity_at, 0) <= :idle_cutoff \
                    or coalesce(wasabi_synced_at, 0) <= :checkpoint_cutoff)"
        ))?;
        let mut rows = stmt.query(named_params! {
            ":idle_cutoff": idle_cutoff,
            ":checkpoint_cutoff": checkpoint_cutoff,
        })?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(state_from_row(row)?);
        }
        Ok(out)
    }

    /// All rows with unsaved state, regardless of thresholds.
    pub fn list_unsaved(&mut self) -> Result<Vec<DatabaseState>, Error> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select {STATE_COLS} from database_state where server_version > wasabi_version"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(state_from_row(row)?);
        }
        Ok(out)
    }

    /// Forcibly releases server locks held longer than `max_hold`, returning
    /// the rows that were released so the caller can log/alert.
    pub fn expire_stale_server_locks(
        &mut self,
        max_hold: Duration,
    ) -> Result<Vec<DatabaseState>, Error> {
        let cutoff = to_micros(self.now()) - max_hold.as_micros() as i64;
        let mut stmt = self.conn.prepare_cached(&format!(
            "select {STATE_COLS} from database_state \
             where lock_type = 'server' and locked_at <= :cutoff"
        ))?;
        let mut rows = stmt.query(named_params! {":cutoff": cutoff})?;
        let mut stale = Vec::new();
        while let Some(row) = rows.next()? {
            stale.push(state_from_row(row)?);
        }
        drop(rows);
        drop(stmt);
        for s in &stale {
            self.release_lock(&s.video_id, s.database_name)?;
        }
        Ok(stale)
    }

    /// Registers a video if not already present; returns whether a row was
    /// created. Status starts `pending`; existing rows are left untouched.
    pub fn upsert_video(&mut self, change: VideoChange) -> Result<bool, Error> {
        let now = to_micros(self.now());
        let mut stmt = self.conn.prepare_cached(
            "insert into video (id, tenant_id, title, storage_key, status, created_at) \
             values (:id, :tenant_id, :title, :storage_key, 'pending', :created_at) \
             on conflict (id) do nothing",
        )?;
        let rows = stmt.execute(named_params! {
            ":id": change.id,
            ":tenant_id": change.tenant_id,
            ":title": change.title,
            ":storage_key": change.storage_key,
            ":created_at": now,
        })?;
        Ok(rows > 0)
    }

    pub fn get_video(&mut self, id: &str) -> Result<Option<Video>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "select id, tenant_id, title, storage_key, status, duration_frames, frame_rate, \
                    current_frameset_version, created_at \
             from video where id = :id",
        )?;
        let mut rows = stmt.query(named_params! {":id": id})?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let status: String = row.get(4)?;
        Ok(Some(Video {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            title: row.get(2)?,
            storage_key: row.get(3)?,
            status: VideoStatus::from_sql(&status)?,
            duration_frames: row.get(5)?,
            frame_rate: row.get(6)?,
            current_frameset_version: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
            created_at: from_micros(row.get(8)?)?,
        }))
    }

    pub fn set_video_status(&mut self, id: &str, status: VideoStatus) -> Result<(), Error> {
        let mut stmt = self
            .conn
            .prepare_cached("update video set status = :status where id = :id")?;
        let rows = stmt.execute(named_params! {":status": status.as_str(), ":id": id})?;
        if rows == 0 {
            bail!(NotFound, msg("no such video {id}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::clock::SimulatedClocks;
    use base::ErrorKind;

    fn test_registry() -> Registry<SimulatedClocks> {
        testutil::init();
        let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        Registry::new(clocks, conn).unwrap()
    }

    #[test]
    fn missing_row_semantics() {
        let r = test_registry();
        let mut l = r.lock();
        assert_eq!(l.get_state("v1", DatabaseName::Layout).unwrap(), None);
        let s = l
            .get_or_create_state("v1", DatabaseName::Layout, "t1")
            .unwrap();
        assert_eq!(s.server_version, 0);
        assert_eq!(s.wasabi_version, 0);
        assert_eq!(s.lock_type, LockType::None);
    }

    #[test]
    fn client_lock_acquire_and_contend() {
        let r = test_registry();
        let mut l = r.lock();
        let s = l
            .acquire_client_lock("v1", DatabaseName::Layout, "alice", "c1", "t1")
            .unwrap();
        assert_eq!(s.lock_type, LockType::Client);
        assert_eq!(s.active_connection_id.as_deref(), Some("c1"));

        // A different user is refused.
        let e = l
            .acquire_client_lock("v1", DatabaseName::Layout, "bob", "c2", "t1")
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);

        // The same user hands off to a new connection.
        let s = l
            .acquire_client_lock("v1", DatabaseName::Layout, "alice", "c3", "t1")
            .unwrap();
        assert_eq!(s.active_connection_id.as_deref(), Some("c3"));
        assert_eq!(s.lock_holder_user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn server_lock_excludes_everyone() {
        let r = test_registry();
        let mut l = r.lock();
        l.get_or_create_state("v1", DatabaseName::Layout, "t1")
            .unwrap();
        assert!(l
            .acquire_server_lock("v1", DatabaseName::Layout, Some("alice"))
            .unwrap());
        assert!(!l
            .acquire_server_lock("v1", DatabaseName::Layout, None)
            .unwrap());
        let e = l
            .acquire_client_lock("v1", DatabaseName::Layout, "alice", "c1", "t1")
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
        l.release_lock("v1", DatabaseName::Layout).unwrap();
        assert!(l
            .acquire_server_lock("v1", DatabaseName::Layout, None)
            .unwrap());
    }

    #[test]
    fn conditional_release_spares_successor() {
        let r = test_registry();
        let mut l = r.lock();
        l.acquire_client_lock("v1", DatabaseName::Layout, "alice", "c1", "t1")
            .unwrap();
        // Hand-off to c2; a late release from c1 must be a no-op.
        l.acquire_client_lock("v1", DatabaseName::Layout, "alice", "c2", "t1")
            .unwrap();
        assert!(!l
            .release_lock_if_connection("v1", DatabaseName::Layout, "c1")
            .unwrap());
        let s = l.get_state("v1", DatabaseName::Layout).unwrap().unwrap();
        assert_eq!(s.active_connection_id.as_deref(), Some("c2"));
        assert!(l
            .release_lock_if_connection("v1", DatabaseName::Layout, "c2")
            .unwrap());
        let s = l.get_state("v1", DatabaseName::Layout).unwrap().unwrap();
        assert_eq!(s.lock_type, LockType::None);
    }

    #[test]
    fn version_counters() {
        let r = test_registry();
        let mut l = r.lock();
        l.get_or_create_state("v1", DatabaseName::Captions, "t1")
            .unwrap();
        assert_eq!(
            l.increment_server_version("v1", DatabaseName::Captions)
                .unwrap(),
            1
        );
        assert_eq!(
            l.increment_server_version("v1", DatabaseName::Captions)
                .unwrap(),
            2
        );
        let now = l.now();
        l.advance_wasabi_version("v1", DatabaseName::Captions, 2, now)
            .unwrap();
        // Never regresses.
        l.advance_wasabi_version("v1", DatabaseName::Captions, 1, now)
            .unwrap();
        let s = l.get_state("v1", DatabaseName::Captions).unwrap().unwrap();
        assert_eq!(s.server_version, 2);
        assert_eq!(s.wasabi_version, 2);
        assert!(s.wasabi_synced_at.is_some());
    }

    #[test]
    fn pending_uploads_thresholds() {
        let r = test_registry();
        let clocks = r.clocks();
        {
            let mut l = r.lock();
            l.get_or_create_state("idle", DatabaseName::Layout, "t1")
                .unwrap();
            l.increment_server_version("idle", DatabaseName::Layout)
                .unwrap();
            l.get_or_create_state("busy", DatabaseName::Layout, "t1")
                .unwrap();
        }
        clocks.advance(Duration::from_secs(10 * 60));
        {
            let mut l = r.lock();
            // "busy" was edited just now; "idle" has been quiet for 10 min.
            l.increment_server_version("busy", DatabaseName::Layout)
                .unwrap();
            let now = l.now();
            l.advance_wasabi_version("busy", DatabaseName::Layout, 0, now)
                .unwrap();
            // Dirty it again after the sync stamp.
            l.increment_server_version("busy", DatabaseName::Layout)
                .unwrap();
            let pending = l
                .list_pending_uploads(Duration::from_secs(5 * 60), Duration::from_secs(15 * 60))
                .unwrap();
            let ids: Vec<_> = pending.iter().map(|s| s.video_id.as_str()).collect();
            assert!(ids.contains(&"idle"));
            assert!(!ids.contains(&"busy"));
        }
        // After the hard-checkpoint window, "busy" is pending despite activity.
        clocks.advance(Duration::from_secs(16 * 60));
        {
            let mut l = r.lock();
            l.touch_activity("busy", DatabaseName::Layout).unwrap();
            let pending = l
                .list_pending_uploads(Duration::from_secs(5 * 60), Duration::from_secs(15 * 60))
                .unwrap();
            assert!(pending.iter().any(|s| s.video_id == "busy"));
        }
    }

    #[test]
    fn unsaved_excludes_synced() {
        let r = test_registry();
        let mut l = r.lock();
        l.get_or_create_state("a", DatabaseName::Layout, "t1")
            .unwrap();
        l.increment_server_version("a", DatabaseName::Layout)
            .unwrap();
        l.get_or_create_state("b", DatabaseName::Layout, "t1")
            .unwrap();
        l.increment_server_version("b", DatabaseName::Layout)
            .unwrap();
        let now = l.now();
        l.advance_wasabi_version("b", DatabaseName::Layout, 1, now)
            .unwrap();
        let unsaved = l.list_unsaved().unwrap();
        assert_eq!(unsaved.len(), 1);
        assert_eq!(unsaved[0].video_id, "a");
    }

    #[test]
    fn stale_server_locks_expire() {
        let r = test_registry();
        let clocks = r.clocks();
        {
            let mut l = r.lock();
            l.get_or_create_state("v1", DatabaseName::Layout, "t1")
                .unwrap();
            assert!(l
                .acquire_server_lock("v1", DatabaseName::Layout, None)
                .unwrap());
        }
        clocks.advance(Duration::from_secs(2 * 60 * 60));
        let mut l = r.lock();
        let stale = l
            .expire_stale_server_locks(Duration::from_secs(60 * 60))
            .unwrap();
        assert_eq!(stale.len(), 1);
        let s = l.get_state("v1", DatabaseName::Layout).unwrap().unwrap();
        assert_eq!(s.lock_type, LockType::None);
    }

    #[test]
    fn video_registration() {
        let r = test_registry();
        let mut l = r.lock();
        let change = VideoChange {
            id: "v1".to_owned(),
            tenant_id: "t1".to_owned(),
            title: Some("ep01".to_owned()),
            storage_key: "t1/client/videos/v1/video.mp4".to_owned(),
        };
        assert!(l.upsert_video(change.clone()).unwrap());
        assert!(!l.upsert_video(change).unwrap());
        let v = l.get_video("v1").unwrap().unwrap();
        assert_eq!(v.status, VideoStatus::Pending);
        l.set_video_status("v1", VideoStatus::Ready).unwrap();
        assert_eq!(
            l.get_video("v1").unwrap().unwrap().status,
            VideoStatus::Ready
        );
    }
}
