// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

use std::path::PathBuf;

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use db::auth::{generate_token, Identity};
use db::registry::Registry;

/// Mints a bearer token for a user. The token is printed once; only its
/// hash is stored.
#[derive(Bpaf, Debug)]
#[bpaf(command("token"))]
pub struct Args {
    /// Path of the registry SQLite database.
    #[bpaf(argument("PATH"), fallback("/var/lib/capsync/registry.db".into()))]
    registry_db: PathBuf,

    /// User id the token authenticates as.
    #[bpaf(argument("USER"))]
    user: String,

    /// Tenant id the token authenticates as.
    #[bpaf(argument("TENANT"))]
    tenant: String,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let conn = rusqlite::Connection::open(&args.registry_db)?;
    let registry = Registry::new(RealClocks {}, conn)?;
    let token = generate_token();
    registry.lock().add_access_token(
        &token,
        &Identity {
            user_id: args.user,
            tenant_id: args.tenant,
        },
    )?;
    println!("{token}");
    Ok(0)
}
