// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Decodes request paths. `database_name` segments are validated here, so
//! handlers never see an unknown database.

use db::registry::DatabaseName;

#[derive(Debug, Eq, PartialEq)]
pub enum Path {
    TopLevel,                            // "/"
    Video(String),                       // "/videos/<id>"
    DatabaseState(String, DatabaseName), // "/videos/<id>/database/<db>/state"
    DatabaseLock(String, DatabaseName),  // "/videos/<id>/database/<db>/lock"
    EnsureState(String, DatabaseName),   // "/videos/<id>/database/<db>/ensure-state"
    Captions(String),                    // "/videos/<id>/captions"
    CaptionsBatch(String),               // "/videos/<id>/captions/batch"
    Caption(String, i64),                // "/videos/<id>/captions/<caption>"
    CaptionText(String, i64),            // "/videos/<id>/captions/<caption>/text"
    ApproveLayout(String),               // "/videos/<id>/actions/approve-layout"
    Sync(String, DatabaseName),          // "/videos/<id>/sync/<db>"
    Webhook,                             // "/webhooks/object-store/videos"
    NotFound,
}

impl Path {
    pub fn decode(path: &str) -> Self {
        if path == "/" {
            return Path::TopLevel;
        }
        if path == "/webhooks/object-store/videos" {
            return Path::Webhook;
        }
        let Some(rest) = path.strip_prefix("/videos/") else {
            return Path::NotFound;
        };
        let (video_id, rest) = match rest.find('/') {
            None => {
                if rest.is_empty() {
                    return Path::NotFound;
                }
                return Path::Video(rest.to_owned());
            }
            Some(i) => (&rest[..i], &rest[i + 1..]),
        };
        if video_id.is_empty() {
            return Path::NotFound;
        }
        let video_id = video_id.to_owned();

        if let Some(rest) = rest.strip_prefix("database/") {
            let Some((db, op)) = rest.split_once('/') else {
                return Path::NotFound;
            };
            let Some(db) = DatabaseName::parse(db) else {
                return Path::NotFound;
            };
            return match op {
                "state" => Path::DatabaseState(video_id, db),
                "lock" => Path::DatabaseLock(video_id, db),
                "ensure-state" => Path::EnsureState(video_id, db),
                _ => Path::NotFound,
            };
        }
        if let Some(rest) = rest.strip_prefix("sync/") {
            return match DatabaseName::parse(rest) {
                Some(db) => Path::Sync(video_id, db),
                None => Path::NotFound,
            };
        }
        if rest == "captions" {
            return Path::Captions(video_id);
        }
        if let Some(rest) = rest.strip_prefix("captions/") {
            if rest == "batch" {
                return Path::CaptionsBatch(video_id);
            }
            if let Some(id) = rest.strip_suffix("/text") {
                return match id.parse::<i64>() {
                    Ok(id) => Path::CaptionText(video_id, id),
                    Err(_) => Path::NotFound,
                };
            }
            return match rest.parse::<i64>() {
                Ok(id) => Path::Caption(video_id, id),
                Err(_) => Path::NotFound,
            };
        }
        if rest == "actions/approve-layout" {
            return Path::ApproveLayout(video_id);
        }
        Path::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        use Path::*;
        assert_eq!(Path::decode("/"), TopLevel);
        assert_eq!(Path::decode("/videos/v1"), Video("v1".to_owned()));
        assert_eq!(
            Path::decode("/videos/v1/database/layout/state"),
            DatabaseState("v1".to_owned(), DatabaseName::Layout)
        );
        assert_eq!(
            Path::decode("/videos/v1/database/captions/lock"),
            DatabaseLock("v1".to_owned(), DatabaseName::Captions)
        );
        assert_eq!(
            Path::decode("/videos/v1/database/layout/ensure-state"),
            EnsureState("v1".to_owned(), DatabaseName::Layout)
        );
        assert_eq!(Path::decode("/videos/v1/captions"), Captions("v1".to_owned()));
        assert_eq!(
            Path::decode("/videos/v1/captions/batch"),
            CaptionsBatch("v1".to_owned())
        );
        assert_eq!(
            Path::decode("/videos/v1/captions/42"),
            Caption("v1".to_owned(), 42)
        );
        assert_eq!(
            Path::decode("/videos/v1/captions/42/text"),
            CaptionText("v1".to_owned(), 42)
        );
        assert_eq!(
            Path::decode("/videos/v1/actions/approve-layout"),
            ApproveLayout("v1".to_owned())
        );
        assert_eq!(
            Path::decode("/videos/v1/sync/layout"),
            Sync("v1".to_owned(), DatabaseName::Layout)
        );
        assert_eq!(Path::decode("/webhooks/object-store/videos"), Webhook);

        // Unknown database names are rejected in routing.
        assert_eq!(Path::decode("/videos/v1/database/notes/state"), NotFound);
        assert_eq!(Path::decode("/videos/v1/sync/notes"), NotFound);
        assert_eq!(Path::decode("/videos/v1/captions/abc"), NotFound);
        assert_eq!(Path::decode("/videos//captions"), NotFound);
        assert_eq!(Path::decode("/api/videos/v1"), NotFound);
    }
}
