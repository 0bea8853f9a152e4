// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Runtime configuration file. The config file is TOML; see
//! `capsync.example.toml` for a commented example.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use db::checkpoint::CheckpointerOptions;
use serde::Deserialize;

fn default_bind_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Address to serve HTTP and websockets on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Path of the registry SQLite database.
    pub registry_db: PathBuf,

    /// Directory holding the CRDT working copies.
    pub working_dir: PathBuf,

    /// Root of the filesystem-backed object store.
    pub object_store_root: PathBuf,

    /// Scratch space for workflow runs; defaults to `working_dir`/staging.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Shared secret for the inbound object-store webhook. The webhook
    /// rejects everything when unset.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default)]
    pub checkpointer: CheckpointerConfig,

    /// Command prefix launching the external crop/encode job. The
    /// approve-layout action fails when unset.
    #[serde(default)]
    pub frame_job_command: Vec<String>,

    /// Command prefix launching initial processing for webhook-registered
    /// videos. Optional.
    #[serde(default)]
    pub ingest_command: Vec<String>,

    /// Tokio worker threads; defaults to the number of cores.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl ConfigFile {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.join("staging"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointerConfig {
    #[serde(default)]
    pub period_secs: Option<u64>,
    #[serde(default)]
    pub idle_secs: Option<u64>,
    #[serde(default)]
    pub checkpoint_secs: Option<u64>,
    #[serde(default)]
    pub max_lock_hold_secs: Option<u64>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl CheckpointerConfig {
    pub fn options(&self) -> CheckpointerOptions {
        let defaults = CheckpointerOptions::default();
        CheckpointerOptions {
            period: self.period_secs.map(Duration::from_secs).unwrap_or(defaults.period),
            idle: self.idle_secs.map(Duration::from_secs).unwrap_or(defaults.idle),
            checkpoint: self
                .checkpoint_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.checkpoint),
            max_server_lock_hold: self
                .max_lock_hold_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_server_lock_hold),
            max_parallel: self.max_parallel.unwrap_or(defaults.max_parallel),
        }
    }
}
