// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The `run` subcommand: the actual server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::clock::RealClocks;
use base::{bail, err, Error, ResultExt as _};
use bpaf::Bpaf;
use db::checkpoint;
use db::object::{FsObjectStore, ObjectStore};
use db::registry::Registry;
use db::workingcopy::WorkingCopies;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use self::config::ConfigFile;
use crate::flow::{
    CommandFrameJob, CommandIngestLauncher, FrameJob, FramesetPublisher, IngestLauncher,
};
use crate::lock::LockManager;
use crate::session::SessionMap;
use crate::web;

pub mod config;

/// Runs the server: accepts annotation sync sessions, checkpoints working
/// copies, and serves workflow actions.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(argument("PATH"), fallback("/etc/capsync.toml".into()))]
    config: PathBuf,
}

fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, msg("unable to read {}", path.display()), source(e)))?;
    toml::from_str(&raw).map_err(|e| {
        err!(
            InvalidArgument,
            msg("unable to parse {}", path.display()),
            source(e)
        )
    })
}

/// A placeholder used when no frame-job command is configured; approve
/// requests fail cleanly instead of hanging.
struct UnconfiguredFrameJob;

#[async_trait::async_trait]
impl FrameJob for UnconfiguredFrameJob {
    async fn run(
        &self,
        _input: &crate::flow::FrameJobInput,
    ) -> Result<crate::flow::FrameJobOutput, Error> {
        bail!(
            FailedPrecondition,
            msg("no frame_job_command configured; can't publish framesets")
        );
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().err_kind(base::ErrorKind::Internal)?;
    let r = rt.block_on(async_run(&config));

    // In the graceful shutdown path we've already waited for the tasks that
    // matter (the final checkpoint); don't wait for stragglers.
    rt.shutdown_background();
    r
}

async fn async_run(config: &ConfigFile) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt()).err_kind(base::ErrorKind::Internal)?;
        let term = signal(SignalKind::terminate()).err_kind(base::ErrorKind::Internal)?;
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config: &ConfigFile, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let clocks = RealClocks {};
    let conn = rusqlite::Connection::open(&config.registry_db).map_err(|e| {
        err!(
            FailedPrecondition,
            msg(
                "unable to open registry at {}; try `capsync init`",
                config.registry_db.display()
            ),
            source(e)
        )
    })?;
    let registry = Arc::new(Registry::new(clocks, conn)?);

    let store: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::new(config.object_store_root.clone())?);
    let copies = Arc::new(WorkingCopies::new(
        config.working_dir.clone(),
        registry.clone(),
        store.clone(),
    )?);
    let sessions = SessionMap::new();
    let locks = Arc::new(LockManager::new(
        registry.clone(),
        copies.clone(),
        sessions.clone(),
    ));

    let frame_job: Arc<dyn FrameJob> = if config.frame_job_command.is_empty() {
        Arc::new(UnconfiguredFrameJob)
    } else {
        Arc::new(CommandFrameJob::new(config.frame_job_command.clone())?)
    };
    let ingest: Option<Arc<dyn IngestLauncher>> = if config.ingest_command.is_empty() {
        None
    } else {
        Some(Arc::new(CommandIngestLauncher::new(
            config.ingest_command.clone(),
        )?))
    };
    let publisher = FramesetPublisher::new(
        registry.clone(),
        copies.clone(),
        store.clone(),
        locks.clone(),
        frame_job,
        config.staging_dir(),
        shutdown_rx.clone(),
    );

    // The checkpointer gets its own shutdown signal so its final sweep can
    // be ordered after the sessions have drained.
    let (checkpoint_shutdown_tx, checkpoint_shutdown_rx) = base::shutdown::channel();
    let (checkpoint_channel, checkpoint_join) = checkpoint::start_checkpointer(
        registry.clone(),
        copies.clone(),
        checkpoint_shutdown_rx,
        config.checkpointer.options(),
    );

    let service = Arc::new(web::Service::new(web::Config {
        registry,
        copies,
        sessions: sessions.clone(),
        locks,
        publisher,
        ingest,
        webhook_secret: config.webhook_secret.clone(),
    }));
    let make_svc = hyper::service::make_service_fn(move |_conn| {
        futures::future::ok::<_, std::convert::Infallible>(hyper::service::service_fn({
            let s = Arc::clone(&service);
            move |req| Arc::clone(&s).serve(req)
        }))
    });
    let server = hyper::server::Server::try_bind(&config.bind_addr)
        .map_err(|e| {
            err!(
                Unavailable,
                msg("unable to bind {}", config.bind_addr),
                source(e)
            )
        })?
        .tcp_nodelay(true)
        .serve(make_svc);
    info!("serving on http://{}", config.bind_addr);

    server
        .with_graceful_shutdown(shutdown_rx.future())
        .await
        .map_err(|e| err!(Internal, msg("server failed"), source(e)))?;

    // Teardown order: the listener is down; now drain websocket sessions,
    // then run the final checkpoint with the locks they held released.
    info!("shutting down: draining {} session(s)", sessions.len());
    sessions.close_all();
    for _ in 0..50 {
        if sessions.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    drop(checkpoint_channel);
    drop(checkpoint_shutdown_tx);
    checkpoint_join
        .await
        .map_err(|e| err!(Internal, msg("checkpointer panicked"), source(e)))?;
    info!("shutdown complete");
    Ok(0)
}
