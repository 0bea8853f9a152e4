// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Persistence layer for capsync: the coordination registry, the CRDT
//! working-copy store, the caption repository, the frameset version
//! registry, the object-store gateway, and the checkpointer.

pub mod auth;
pub mod captions;
pub mod checkpoint;
pub mod object;
pub mod registry;
pub mod testutil;
pub mod versions;
pub mod workingcopy;

pub use crate::registry::{
    init, DatabaseName, DatabaseState, LockType, LockedRegistry, Registry, Video, VideoChange,
    VideoStatus,
};
pub use crate::workingcopy::RowDelta;
