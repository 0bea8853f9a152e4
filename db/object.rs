// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Object-store gateway: durable blob storage keyed
//! `{tenant}/{scope}/videos/{video}/…`.
//!
//! The trait keeps the actual store SDK out of the core; [`FsObjectStore`]
//! backs it with a local directory tree, which is also what the tests use.
//! The gateway itself never retries: it classifies errors (`Unavailable` is
//! retryable, `PermissionDenied`/`NotFound` are not) and leaves backoff to
//! the checkpointer and workflows.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base::{bail, err, Error, ErrorKind};
use tracing::trace;

use crate::registry::DatabaseName;

/// Storage scope within a tenant's prefix: `client` blobs are served to
/// browsers, `server` blobs are internal artifacts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Scope {
    Client,
    Server,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Client => "client",
            Scope::Server => "server",
        }
    }
}

/// A validated object key. Construction goes through the builders so every
/// key has the `{tenant}/{scope}/videos/{video}/…` shape; the shape is
/// compatibility-critical for existing stored data.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn build(tenant: &str, scope: Scope, video: &str, rest: &str) -> Self {
        ObjectKey(format!("{tenant}/{}/videos/{video}/{rest}", scope.as_str()))
    }

    /// Key of the original media blob.
    pub fn video_media(tenant: &str, video: &str) -> Self {
        Self::build(tenant, Scope::Client, video, "video.mp4")
    }

    /// Key of a persisted (gzipped) annotation working copy. Annotation
    /// databases are client-visible: browsers seed their CRDT peers from
    /// these blobs.
    pub fn database(tenant: &str, video: &str, db: DatabaseName) -> Self {
        Self::build(tenant, Scope::Client, video, &format!("{}.db.gz", db.as_str()))
    }

    /// Key of the raw OCR database produced by the extraction pipeline.
    /// Server-only; never handed to browsers.
    pub fn raw_ocr_db(tenant: &str, video: &str) -> Self {
        Self::build(tenant, Scope::Server, video, "raw-ocr.db.gz")
    }

    pub fn full_frame(tenant: &str, video: &str, index: u32) -> Self {
        Self::build(
            tenant,
            Scope::Client,
            video,
            &format!("full_frames/frame_{index:06}.jpg"),
        )
    }

    pub fn cropped_chunk(tenant: &str, video: &str, version: u32, modulo: u32, index: u32) -> Self {
        Self::build(
            tenant,
            Scope::Client,
            video,
            &format!("cropped_frames/v{version}/modulo_{modulo}/chunk_{index:04}.webm"),
        )
    }

    /// Prefix under which all chunks of a frameset version live.
    pub fn cropped_prefix(tenant: &str, video: &str, version: u32) -> String {
        format!("{tenant}/client/videos/{video}/cropped_frames/v{version}/")
    }

    pub fn caption_frame_extents_db(tenant: &str, video: &str, version: u32) -> Self {
        Self::build(
            tenant,
            Scope::Server,
            video,
            &format!("caption_frame_extents_v{version}.db"),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload for [`ObjectStore::upload`].
pub enum UploadBody {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Minimal capability set against the blob store. Implementations must make
/// `upload` idempotent by key and must not retry internally.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn upload(&self, key: &ObjectKey, body: UploadBody, content_type: &str)
        -> Result<(), Error>;

    /// Fails with `NotFound` if the key is missing.
    async fn download(&self, key: &ObjectKey, dest: &Path) -> Result<(), Error>;

    async fn exists(&self, key: &ObjectKey) -> Result<bool, Error>;

    async fn list(&self, prefix: &str, max_keys: Option<usize>) -> Result<Vec<String>, Error>;

    /// Returns the number of objects deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, Error>;
}

/// Filesystem-backed store rooted at a local directory. Keys map directly
/// to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Result<Self, Error> {
        std::fs::create_dir_all(&root)
            .map_err(|e| err!(Unavailable, msg("unable to create {}", root.display()), source(e)))?;
        Ok(FsObjectStore { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
        if key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            bail!(InvalidArgument, msg("invalid object key {key:?}"));
        }
        Ok(self.root.join(key))
    }
}

/// Maps a filesystem error onto the gateway's retry classification.
fn classify_io(e: std::io::Error, what: &str) -> Error {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::Unavailable,
    };
    Error::new(kind, Some(what.to_owned()), Some(Box::new(e)))
}

fn collect_keys(
    root: &Path,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<String>,
) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_keys(root, &path, prefix, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(
        &self,
        key: &ObjectKey,
        body: UploadBody,
        _content_type: &str,
    ) -> Result<(), Error> {
        let dest = self.path_for(key.as_str())?;
        trace!("upload {key}");
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| classify_io(e, "unable to create parent dir"))?;
            }
            // Write to a sibling temp path, then rename, so a concurrent
            // download never observes a partial object.
            let tmp = dest.with_extension("partial");
            match body {
                UploadBody::Bytes(b) => {
                    std::fs::write(&tmp, b).map_err(|e| classify_io(e, "unable to write object"))?
                }
                UploadBody::File(src) => {
                    std::fs::copy(&src, &tmp)
                        .map_err(|e| classify_io(e, "unable to copy object"))
                        .map(|_| ())?;
                }
            }
            std::fs::rename(&tmp, &dest).map_err(|e| classify_io(e, "unable to install object"))?;
            Ok(())
        })
        .await
        .map_err(|e| err!(Internal, msg("upload task panicked"), source(e)))?
    }

    async fn download(&self, key: &ObjectKey, dest: &Path) -> Result<(), Error> {
        let src = self.path_for(key.as_str())?;
        let dest = dest.to_owned();
        let key = key.clone();
        trace!("download {key}");
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| classify_io(e, "unable to create parent dir"))?;
            }
            match std::fs::copy(&src, &dest) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(err!(NotFound, msg("no object {key}")))
                }
                Err(e) => Err(classify_io(e, "unable to download object")),
            }
        })
        .await
        .map_err(|e| err!(Internal, msg("download task panicked"), source(e)))?
    }

    async fn exists(&self, key: &ObjectKey) -> Result<bool, Error> {
        let path = self.path_for(key.as_str())?;
        match tokio::fs::metadata(&path).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(classify_io(e, "unable to stat object")),
        }
    }

    async fn list(&self, prefix: &str, max_keys: Option<usize>) -> Result<Vec<String>, Error> {
        let root = self.root.clone();
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, Error> {
            let mut out = Vec::new();
            match collect_keys(&root, &root, &prefix, &mut out) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(classify_io(e, "unable to list objects")),
            }
            out.sort();
            if let Some(max) = max_keys {
                out.truncate(max);
            }
            Ok(out)
        })
        .await
        .map_err(|e| err!(Internal, msg("list task panicked"), source(e)))?
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, Error> {
        let keys = self.list(prefix, None).await?;
        let root = self.root.clone();
        let n = keys.len();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            for key in keys {
                match std::fs::remove_file(root.join(&key)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(classify_io(e, "unable to delete object")),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| err!(Internal, msg("delete task panicked"), source(e)))??;
        Ok(n)
    }
}
