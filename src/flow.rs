// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The versioned frameset publication flow: acquire the server lock on the
//! layout database, stage inputs, run the external crop/encode job, upload
//! the chunk hierarchy, and atomically flip the new version to active.
//!
//! Every step after the version row is created marks the row `failed` on
//! error, and the lock is released on all paths; the previous active
//! version is never touched until the single activation transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base::clock::{Backoff, Clocks};
use base::{bail, err, shutdown, Error};
use db::object::{ObjectKey, ObjectStore, UploadBody};
use db::registry::{DatabaseName, Registry, Video};
use db::versions::{CropBounds, FramesetVersionInsert};
use db::workingcopy::WorkingCopies;
use tracing::{error, info, info_span, warn, Instrument as _};
use uuid::Uuid;

use crate::lock::LockManager;

/// Hierarchical sampling levels, coarsest first. Uploading in this order
/// lets progressive loaders show something quickly.
pub const MODULO_LEVELS: [u32; 6] = [32, 16, 8, 4, 2, 1];

/// Frames per encoded chunk; matches the frontend loading system.
pub const FRAMES_PER_CHUNK: u32 = 32;

/// Attempts per blob transfer before the flow gives up.
const MAX_TRANSFER_ATTEMPTS: u32 = 5;

pub struct FrameJobInput {
    pub video_path: PathBuf,
    pub layout_path: PathBuf,
    pub crop: CropBounds,
    pub frame_rate: f64,
    pub out_dir: PathBuf,
}

pub struct ChunkFile {
    pub modulo: u32,
    pub index: u32,
    pub path: PathBuf,
}

pub struct FrameJobOutput {
    pub chunks: Vec<ChunkFile>,
    pub total_frames: u64,
}

/// The external (GPU) crop-and-encode job. The flow only consumes its
/// results; how frames actually get decoded and re-encoded lives outside
/// this process.
#[async_trait]
pub trait FrameJob: Send + Sync + 'static {
    async fn run(&self, input: &FrameJobInput) -> Result<FrameJobOutput, Error>;
}

/// Launches the external job as a configured command. The command receives
/// the staged inputs and is expected to fill `out_dir` with
/// `modulo_{m}/chunk_{i:04}.webm` files plus a `summary.json` carrying
/// `{"totalFrames": n}`.
pub struct CommandFrameJob {
    argv: Vec<String>,
}

impl CommandFrameJob {
    pub fn new(argv: Vec<String>) -> Result<Self, Error> {
        if argv.is_empty() {
            bail!(InvalidArgument, msg("frame job command is empty"));
        }
        Ok(CommandFrameJob { argv })
    }
}

#[async_trait]
impl FrameJob for CommandFrameJob {
    async fn run(&self, input: &FrameJobInput) -> Result<FrameJobOutput, Error> {
        std::fs::create_dir_all(&input.out_dir)?;
        let crop = &input.crop;
        let status = tokio::process::Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg("--video")
            .arg(&input.video_path)
            .arg("--layout")
            .arg(&input.layout_path)
            .arg("--out-dir")
            .arg(&input.out_dir)
            .arg("--crop")
            .arg(format!("{},{},{},{}", crop.left, crop.top, crop.right, crop.bottom))
            .arg("--frame-rate")
            .arg(input.frame_rate.to_string())
            .status()
            .await
            .map_err(|e| err!(Unavailable, msg("unable to launch frame job"), source(e)))?;
        if !status.success() {
            bail!(Unknown, msg("frame job exited with {status}"));
        }
        collect_job_output(&input.out_dir)
    }
}

/// Reads the chunk tree and summary the job left behind.
fn collect_job_output(out_dir: &Path) -> Result<FrameJobOutput, Error> {
    let summary_path = out_dir.join("summary.json");
    let summary: serde_json::Value = serde_json::from_slice(&std::fs::read(&summary_path)?)?;
    let total_frames = summary
        .get("totalFrames")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| err!(DataLoss, msg("frame job summary is missing totalFrames")))?;
    let mut chunks = Vec::new();
    for &modulo in &MODULO_LEVELS {
        let dir = out_dir.join(format!("modulo_{modulo}"));
        if !dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(index) = name
                .strip_prefix("chunk_")
                .and_then(|n| n.strip_suffix(".webm"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            chunks.push(ChunkFile {
                modulo,
                index,
                path: entry.path(),
            });
        }
    }
    if chunks.is_empty() {
        bail!(DataLoss, msg("frame job produced no chunks"));
    }
    Ok(FrameJobOutput {
        chunks,
        total_frames,
    })
}

/// Launcher for the initial-processing pipeline kicked off by the inbound
/// video webhook. External, like the frame job.
#[async_trait]
pub trait IngestLauncher: Send + Sync + 'static {
    /// Starts processing for a newly registered video; returns a job id.
    async fn launch(&self, video: &Video) -> Result<String, Error>;
}

/// Spawns a configured command, detached, passing the video and tenant ids.
pub struct CommandIngestLauncher {
    argv: Vec<String>,
}

impl CommandIngestLauncher {
    pub fn new(argv: Vec<String>) -> Result<Self, Error> {
        if argv.is_empty() {
            bail!(InvalidArgument, msg("ingest command is empty"));
        }
        Ok(CommandIngestLauncher { argv })
    }
}

#[async_trait]
impl IngestLauncher for CommandIngestLauncher {
    async fn launch(&self, video: &Video) -> Result<String, Error> {
        let job_id = Uuid::new_v4().to_string();
        tokio::process::Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg("--video")
            .arg(&video.id)
            .arg("--tenant")
            .arg(&video.tenant_id)
            .arg("--job-id")
            .arg(&job_id)
            .spawn()
            .map_err(|e| err!(Unavailable, msg("unable to launch ingest job"), source(e)))?;
        Ok(job_id)
    }
}

pub struct FramesetPublisher<C: Clocks + Clone> {
    registry: Arc<Registry<C>>,
    copies: Arc<WorkingCopies<C>>,
    store: Arc<dyn ObjectStore>,
    locks: Arc<LockManager<C>>,
    job: Arc<dyn FrameJob>,
    staging_dir: PathBuf,
    shutdown_rx: shutdown::Receiver,
}

impl<C: Clocks + Clone> FramesetPublisher<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry<C>>,
        copies: Arc<WorkingCopies<C>>,
        store: Arc<dyn ObjectStore>,
        locks: Arc<LockManager<C>>,
        job: Arc<dyn FrameJob>,
        staging_dir: PathBuf,
        shutdown_rx: shutdown::Receiver,
    ) -> Arc<Self> {
        Arc::new(FramesetPublisher {
            registry,
            copies,
            store,
            locks,
            job,
            staging_dir,
            shutdown_rx,
        })
    }

    /// Validates the video and spawns the flow in the background, returning
    /// its run id.
    pub fn spawn(
        self: &Arc<Self>,
        video_id: &str,
        crop: CropBounds,
        user_id: Option<String>,
    ) -> Result<Uuid, Error> {
        let video = self
            .registry
            .lock()
            .get_video(video_id)?
            .ok_or_else(|| err!(NotFound, msg("no such video {video_id}")))?;
        let run_id = Uuid::new_v4();
        let this = self.clone();
        let span = info_span!("frameset_flow", run_id = %run_id, video = %video.id);
        tokio::spawn(
            async move {
                match this.publish(run_id, video, crop, user_id).await {
                    Ok(version) => info!("published frameset v{version}"),
                    Err(e) => error!(err = %e.chain(), "frameset flow failed"),
                }
            }
            .instrument(span),
        );
        Ok(run_id)
    }

    /// Runs the flow to completion. Public for tests and synchronous
    /// callers; `spawn` is the API entry point.
    pub async fn publish(
        &self,
        run_id: Uuid,
        video: Video,
        crop: CropBounds,
        user_id: Option<String>,
    ) -> Result<u32, Error> {
        // Step 1: server lock on the layout database; contention fails the
        // flow immediately.
        self.locks.acquire_server(
            &video.id,
            DatabaseName::Layout,
            &video.tenant_id,
            user_id.as_deref(),
        )?;
        let staging = self.staging_dir.join(run_id.to_string());
        let result = self
            .publish_locked(run_id, &staging, &video, crop, user_id.as_deref())
            .await;
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("unable to clean staging dir: {e}");
            }
        }
        if let Err(e) = self.locks.release_server(&video.id, DatabaseName::Layout) {
            warn!(err = %e.chain(), "unable to release server lock after flow");
        }
        result
    }

    async fn publish_locked(
        &self,
        run_id: Uuid,
        staging: &Path,
        video: &Video,
        crop: CropBounds,
        user_id: Option<&str>,
    ) -> Result<u32, Error> {
        let (tenant, vid) = (video.tenant_id.as_str(), video.id.as_str());
        std::fs::create_dir_all(staging)?;

        // Step 2: stage inputs. If this node has layout edits that haven't
        // been persisted yet, flush them first (we hold the server lock, so
        // nothing else can be writing).
        let video_path = staging.join("video.mp4");
        self.download_with_retry(&ObjectKey::video_media(tenant, vid), &video_path)
            .await?;
        if self
            .copies
            .has_working_copy(tenant, vid, DatabaseName::Layout)
        {
            let snapshot = self
                .copies
                .upload_to_store(tenant, vid, DatabaseName::Layout)
                .await?;
            let now = self.registry.clocks().realtime();
            self.registry.lock().advance_wasabi_version(
                vid,
                DatabaseName::Layout,
                snapshot,
                now,
            )?;
        }
        let layout_path = staging.join("layout.db.gz");
        self.download_with_retry(
            &ObjectKey::database(tenant, vid, DatabaseName::Layout),
            &layout_path,
        )
        .await?;
        let source_layout_hash = sha256_file(&layout_path).await?;

        // Steps 3-4: allocate the next version and create the pending row.
        let frame_rate = video.frame_rate.unwrap_or(30.0);
        let version = {
            let mut l = self.registry.lock();
            let version = l.next_frameset_version(vid)?;
            let prefix = ObjectKey::cropped_prefix(tenant, vid, version);
            l.create_frameset_version(
                vid,
                version,
                &prefix,
                &FramesetVersionInsert {
                    crop_bounds: crop,
                    frame_rate,
                    source_layout_hash,
                    created_by_user_id: user_id.map(str::to_owned),
                    flow_run_id: Some(run_id.to_string()),
                },
            )?;
            version
        };

        // Steps 5-8; any failure from here on marks the row failed and
        // leaves the previous active version untouched.
        let produce = self
            .produce_and_activate(staging, tenant, vid, version, crop, frame_rate, video_path)
            .await;
        match produce {
            Ok(()) => Ok(version),
            Err(e) => {
                if let Err(e2) = self
                    .registry
                    .lock()
                    .mark_frameset_version_failed(vid, version)
                {
                    warn!(err = %e2.chain(), "unable to mark version v{version} failed");
                }
                Err(e)
            }
        }
    }

    async fn produce_and_activate(
        &self,
        staging: &Path,
        tenant: &str,
        vid: &str,
        version: u32,
        crop: CropBounds,
        frame_rate: f64,
        video_path: PathBuf,
    ) -> Result<(), Error> {
        // Step 5: the external job.
        let out_dir = staging.join("chunks");
        let output = self
            .job
            .run(&FrameJobInput {
                video_path,
                layout_path: staging.join("layout.db.gz"),
                crop,
                frame_rate,
                out_dir,
            })
            .await?;

        // Step 6: upload, coarsest modulo first, each level in index order.
        let mut chunk_count = 0u32;
        let mut total_size = 0u64;
        for &modulo in &MODULO_LEVELS {
            let mut level: Vec<&ChunkFile> =
                output.chunks.iter().filter(|c| c.modulo == modulo).collect();
            level.sort_by_key(|c| c.index);
            for chunk in level {
                let key = ObjectKey::cropped_chunk(tenant, vid, version, modulo, chunk.index);
                total_size += std::fs::metadata(&chunk.path)?.len();
                self.upload_with_retry(&key, &chunk.path).await?;
                chunk_count += 1;
            }
        }
        info!("uploaded {chunk_count} chunks ({total_size} bytes) for v{version}");

        // Step 7: totals.
        self.registry.lock().update_frameset_totals(
            vid,
            version,
            chunk_count,
            output.total_frames,
            total_size,
        )?;

        // Step 8: activate and demote the predecessor in one transaction.
        self.registry
            .lock()
            .activate_frameset_version(vid, version)?;
        Ok(())
    }

    async fn download_with_retry(&self, key: &ObjectKey, dest: &Path) -> Result<(), Error> {
        let clocks = self.registry.clocks();
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.download(key, dest).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind().is_retryable() && attempts < MAX_TRANSFER_ATTEMPTS => {
                    backoff.wait(&clocks, &self.shutdown_rx, &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_with_retry(&self, key: &ObjectKey, path: &Path) -> Result<(), Error> {
        let clocks = self.registry.clocks();
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .store
                .upload(key, UploadBody::File(path.to_owned()), "video/webm")
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.kind().is_retryable() && attempts < MAX_TRANSFER_ATTEMPTS => {
                    backoff.wait(&clocks, &self.shutdown_rx, &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn sha256_file(path: &Path) -> Result<String, Error> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || -> Result<String, Error> {
        use std::io::Read;
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        let mut f = std::fs::File::open(&path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.update(&buf[..n]);
        }
        let digest = ctx.finish();
        let mut out = String::with_capacity(64);
        for b in digest.as_ref() {
            use std::fmt::Write as _;
            write!(&mut out, "{b:02x}").expect("writing to a String can't fail");
        }
        Ok(out)
    })
    .await
    .map_err(|e| err!(Internal, msg("hash task panicked"), source(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionMap;
    use db::testutil::{TestHarness, TEST_TENANT, TEST_VIDEO};
    use db::versions::VersionStatus;

    /// Writes a tiny fake chunk tree instead of decoding video.
    struct FakeFrameJob {
        fail: bool,
    }

    #[async_trait]
    impl FrameJob for FakeFrameJob {
        async fn run(&self, input: &FrameJobInput) -> Result<FrameJobOutput, Error> {
            if self.fail {
                bail!(Unknown, msg("GPU exploded"));
            }
            std::fs::create_dir_all(&input.out_dir)?;
            for &modulo in &[32u32, 1] {
                let dir = input.out_dir.join(format!("modulo_{modulo}"));
                std::fs::create_dir_all(&dir)?;
                for i in 0..2u32 {
                    std::fs::write(dir.join(format!("chunk_{i:04}.webm")), b"webm")?;
                }
            }
            std::fs::write(input.out_dir.join("summary.json"), br#"{"totalFrames": 64}"#)?;
            collect_job_output(&input.out_dir)
        }
    }

    fn crop() -> CropBounds {
        CropBounds {
            left: 0,
            top: 600,
            right: 1920,
            bottom: 1080,
        }
    }

    async fn publisher(
        h: &TestHarness,
        fail: bool,
    ) -> (
        Arc<FramesetPublisher<base::clock::SimulatedClocks>>,
        shutdown::Sender,
    ) {
        let sessions = SessionMap::new();
        let locks = Arc::new(LockManager::new(
            h.registry.clone(),
            h.copies.clone(),
            sessions,
        ));
        let (tx, rx) = base::shutdown::channel();
        let p = FramesetPublisher::new(
            h.registry.clone(),
            h.copies.clone(),
            h.store.clone(),
            locks,
            Arc::new(FakeFrameJob { fail }),
            h.tmpdir.path().join("staging"),
            rx,
        );
        (p, tx)
    }

    async fn stage_blobs(h: &TestHarness) {
        h.store
            .upload(
                &ObjectKey::video_media(TEST_TENANT, TEST_VIDEO),
                UploadBody::Bytes(b"mp4".to_vec()),
                "video/mp4",
            )
            .await
            .unwrap();
        h.store
            .upload(
                &ObjectKey::database(TEST_TENANT, TEST_VIDEO, DatabaseName::Layout),
                UploadBody::Bytes(b"layoutdb".to_vec()),
                "application/gzip",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_then_republish_archives_predecessor() {
        let h = TestHarness::new().await;
        h.add_test_video();
        stage_blobs(&h).await;
        let (p, _shutdown_tx) = publisher(&h, false).await;

        let video = h.registry.lock().get_video(TEST_VIDEO).unwrap().unwrap();
        let v1 = p
            .publish(Uuid::new_v4(), video.clone(), crop(), Some("alice".to_owned()))
            .await
            .unwrap();
        assert_eq!(v1, 1);
        {
            let mut l = h.registry.lock();
            let active = l.active_frameset_version(TEST_VIDEO).unwrap().unwrap();
            assert_eq!(active.version, 1);
            assert_eq!(active.chunk_count, Some(4));
            assert_eq!(active.total_frames, Some(64));
            assert_eq!(
                l.get_video(TEST_VIDEO).unwrap().unwrap().current_frameset_version,
                Some(1)
            );
            // Lock released on completion.
            let s = l.get_state(TEST_VIDEO, DatabaseName::Layout).unwrap().unwrap();
            assert_eq!(s.lock_type, db::LockType::None);
        }
        // Chunks landed under the versioned prefix.
        let keys = h
            .store
            .list(&ObjectKey::cropped_prefix(TEST_TENANT, TEST_VIDEO, 1), None)
            .await
            .unwrap();
        assert_eq!(keys.len(), 4);

        let v2 = p
            .publish(Uuid::new_v4(), video, crop(), None)
            .await
            .unwrap();
        assert_eq!(v2, 2);
        let mut l = h.registry.lock();
        assert_eq!(
            l.get_frameset_version(TEST_VIDEO, 1).unwrap().unwrap().status,
            VersionStatus::Archived
        );
        assert_eq!(
            l.active_frameset_version(TEST_VIDEO).unwrap().unwrap().version,
            2
        );
    }

    #[tokio::test]
    async fn failed_job_marks_version_failed_and_keeps_active() {
        let h = TestHarness::new().await;
        h.add_test_video();
        stage_blobs(&h).await;

        let (ok, _shutdown_tx) = publisher(&h, false).await;
        let video = h.registry.lock().get_video(TEST_VIDEO).unwrap().unwrap();
        ok.publish(Uuid::new_v4(), video.clone(), crop(), None)
            .await
            .unwrap();

        let (failing, _shutdown_tx2) = publisher(&h, true).await;
        failing
            .publish(Uuid::new_v4(), video, crop(), None)
            .await
            .unwrap_err();

        let mut l = h.registry.lock();
        assert_eq!(
            l.get_frameset_version(TEST_VIDEO, 2).unwrap().unwrap().status,
            VersionStatus::Failed
        );
        assert_eq!(
            l.active_frameset_version(TEST_VIDEO).unwrap().unwrap().version,
            1
        );
        // The lock is released even on failure.
        let s = l.get_state(TEST_VIDEO, DatabaseName::Layout).unwrap().unwrap();
        assert_eq!(s.lock_type, db::LockType::None);
    }

    #[tokio::test]
    async fn contention_fails_immediately() {
        let h = TestHarness::new().await;
        h.add_test_video();
        stage_blobs(&h).await;
        let (p, _shutdown_tx) = publisher(&h, false).await;
        h.registry
            .lock()
            .acquire_client_lock(TEST_VIDEO, DatabaseName::Layout, "alice", "c1", TEST_TENANT)
            .unwrap();
        let video = h.registry.lock().get_video(TEST_VIDEO).unwrap().unwrap();
        let e = p
            .publish(Uuid::new_v4(), video, crop(), None)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
        // No version row was created.
        assert!(h
            .registry
            .lock()
            .list_frameset_versions(TEST_VIDEO)
            .unwrap()
            .is_empty());
    }
}
