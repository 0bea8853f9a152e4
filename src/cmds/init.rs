// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

use std::path::PathBuf;

use base::{err, Error};
use bpaf::Bpaf;
use tracing::info;

/// Initializes the registry database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Path of the registry SQLite database to create.
    #[bpaf(argument("PATH"), fallback("/var/lib/capsync/registry.db".into()))]
    registry_db: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    if let Some(parent) = args.registry_db.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            err!(
                PermissionDenied,
                msg("unable to create {}", parent.display()),
                source(e)
            )
        })?;
    }
    let mut conn = rusqlite::Connection::open(&args.registry_db)?;

    // Skip if already initialized.
    let already: i64 = conn.query_row(
        "select count(*) from sqlite_master where type = 'table' and name = 'meta'",
        [],
        |row| row.get(0),
    )?;
    if already > 0 {
        info!("registry at {} is already initialized", args.registry_db.display());
        return Ok(0);
    }

    conn.execute_batch("pragma journal_mode = wal;")?;
    db::init(&mut conn)?;
    info!("registry initialized at {}", args.registry_db.display());
    Ok(0)
}
