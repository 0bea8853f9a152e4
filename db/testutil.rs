// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Utilities for automated testing involving capsync's persistence library.
//! Used for tests of both the `capsync_db` crate itself and the `capsync`
//! crate.

use std::sync::Arc;

use base::clock::SimulatedClocks;
use jiff::Timestamp;
use tempfile::TempDir;

use crate::object::{FsObjectStore, ObjectStore};
use crate::registry::{self, DatabaseName, Registry, VideoChange};
use crate::workingcopy::WorkingCopies;

/// Performs global initialization for tests: tracing to the test writer.
pub fn init() {
    base::tracing_setup::install_for_tests();
}

pub const TEST_TENANT: &str = "tenant-1";
pub const TEST_VIDEO: &str = "video-1";

/// Registry + object store + working copies rooted in a temp dir, all on a
/// simulated clock.
pub struct TestHarness {
    pub clocks: SimulatedClocks,
    pub registry: Arc<Registry<SimulatedClocks>>,
    pub store: Arc<dyn ObjectStore>,
    pub copies: Arc<WorkingCopies<SimulatedClocks>>,
    pub tmpdir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        init();
        let tmpdir = tempfile::Builder::new()
            .prefix("capsync-test")
            .tempdir()
            .unwrap();
        let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        registry::init(&mut conn).unwrap();
        let registry = Arc::new(Registry::new(clocks.clone(), conn).unwrap());
        let store: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(tmpdir.path().join("store")).unwrap());
        let copies = Arc::new(
            WorkingCopies::new(
                tmpdir.path().join("working"),
                registry.clone(),
                store.clone(),
            )
            .unwrap(),
        );
        TestHarness {
            clocks,
            registry,
            store,
            copies,
            tmpdir,
        }
    }

    /// Registers the standard test video and returns its id.
    pub fn add_test_video(&self) -> String {
        let mut l = self.registry.lock();
        l.upsert_video(VideoChange {
            id: TEST_VIDEO.to_owned(),
            tenant_id: TEST_TENANT.to_owned(),
            title: Some("test video".to_owned()),
            storage_key: format!("{TEST_TENANT}/client/videos/{TEST_VIDEO}/video.mp4"),
        })
        .unwrap();
        l.get_or_create_state(TEST_VIDEO, DatabaseName::Layout, TEST_TENANT)
            .unwrap();
        l.get_or_create_state(TEST_VIDEO, DatabaseName::Captions, TEST_TENANT)
            .unwrap();
        TEST_VIDEO.to_owned()
    }
}
