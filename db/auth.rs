// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Bearer-token verification.
//!
//! Token issuance lives outside the core; the registry stores only the
//! blake3 hash of each accepted token alongside the `{user_id, tenant_id}`
//! it authenticates as. The raw token never touches disk or logs.

use base::clock::Clocks;
use base::{bail, Error};
use rusqlite::named_params;

use crate::registry::{to_micros, LockedRegistry};

/// The identity a verified bearer token yields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: String,
}

/// A bearer token in transit. Deliberately has no `Debug`/`Display` of its
/// contents.
pub struct BearerToken<'a>(&'a str);

impl<'a> BearerToken<'a> {
    /// Parses an `Authorization` header value of the form `Bearer <token>`.
    pub fn from_header(value: &'a str) -> Option<Self> {
        let token = value.strip_prefix("Bearer ")?.trim();
        if token.is_empty() {
            return None;
        }
        Some(BearerToken(token))
    }

    /// Wraps a raw token (e.g. from a websocket query parameter).
    pub fn from_raw(token: &'a str) -> Option<Self> {
        if token.is_empty() {
            return None;
        }
        Some(BearerToken(token))
    }

    fn hash(&self) -> [u8; 32] {
        *blake3::hash(self.0.as_bytes()).as_bytes()
    }
}

/// Compares an inbound webhook secret against the configured one in
/// constant time.
pub fn webhook_secret_matches(configured: &str, presented: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(configured.as_bytes(), presented.as_bytes())
        .is_ok()
}

impl<C: Clocks + Clone> LockedRegistry<C> {
    /// Verifies a bearer token, returning the identity it authenticates as
    /// and stamping `last_used_at`.
    pub fn authenticate_bearer(&mut self, token: BearerToken) -> Result<Identity, Error> {
        let hash = token.hash();
        let now = to_micros(self.now());
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "select user_id, tenant_id from access_token where token_hash = :token_hash",
        )?;
        let mut rows = stmt.query(named_params! {":token_hash": hash.as_slice()})?;
        let Some(row) = rows.next()? else {
            bail!(Unauthenticated, msg("unknown bearer token"));
        };
        let identity = Identity {
            user_id: row.get(0)?,
            tenant_id: row.get(1)?,
        };
        drop(rows);
        drop(stmt);
        let mut stmt = conn.prepare_cached(
            "update access_token set last_used_at = :now where token_hash = :token_hash",
        )?;
        stmt.execute(named_params! {":now": now, ":token_hash": hash.as_slice()})?;
        Ok(identity)
    }

    /// Records a token hash for `identity`. Called by the `token` subcommand
    /// and tests; the token itself is generated by the caller.
    pub fn add_access_token(&mut self, token: &str, identity: &Identity) -> Result<(), Error> {
        let hash = *blake3::hash(token.as_bytes()).as_bytes();
        let now = to_micros(self.now());
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "insert into access_token (token_hash, user_id, tenant_id, created_at) \
             values (:token_hash, :user_id, :tenant_id, :created_at)",
        )?;
        stmt.execute(named_params! {
            ":token_hash": hash.as_slice(),
            ":user_id": identity.user_id,
            ":tenant_id": identity.tenant_id,
            ":created_at": now,
        })?;
        Ok(())
    }
}

/// Generates a fresh random token, base64-encoded. The caller prints it
/// once; only its hash is stored.
pub fn generate_token() -> String {
    use base64::Engine as _;
    let uuid_pair = [uuid::Uuid::new_v4(), uuid::Uuid::new_v4()];
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(uuid_pair[0].as_bytes());
    bytes[16..].copy_from_slice(uuid_pair[1].as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{init, Registry};
    use crate::testutil;
    use base::clock::SimulatedClocks;
    use base::ErrorKind;

    fn test_registry() -> Registry<SimulatedClocks> {
        testutil::init();
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        Registry::new(SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH), conn).unwrap()
    }

    #[test]
    fn roundtrip() {
        let r = test_registry();
        let mut l = r.lock();
        let identity = Identity {
            user_id: "alice".to_owned(),
            tenant_id: "t1".to_owned(),
        };
        let token = generate_token();
        l.add_access_token(&token, &identity).unwrap();
        let got = l
            .authenticate_bearer(BearerToken::from_raw(&token).unwrap())
            .unwrap();
        assert_eq!(got, identity);
    }

    #[test]
    fn unknown_token_rejected() {
        let r = test_registry();
        let mut l = r.lock();
        let e = l
            .authenticate_bearer(BearerToken::from_raw("nope").unwrap())
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn header_parsing() {
        assert!(BearerToken::from_header("Bearer abc").is_some());
        assert!(BearerToken::from_header("Basic abc").is_none());
        assert!(BearerToken::from_header("Bearer ").is_none());
    }

    #[test]
    fn webhook_secret() {
        assert!(webhook_secret_matches("s3cret", "s3cret"));
        assert!(!webhook_secret_matches("s3cret", "guess"));
    }
}
