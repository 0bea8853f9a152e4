// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Logic for setting up a `tracing` subscriber according to our preferences.

use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Custom panic hook that logs instead of directly writing to stderr, so
/// panics land in the same stream (with timestamps) as everything else.
fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(s)
    } else if let Some(s) = p.payload().downcast_ref::<String>() {
        Some(s)
    } else {
        None
    };
    error!(
        target: "panic",
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        "panic",
    );
}

/// Installs the global subscriber and panic hook for server binaries.
pub fn install() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_thread_names(true))
        .with(default_filter())
        .init();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |p| {
        panic_hook(p);
        default_hook(p);
    }));
}

/// Installs a test-friendly subscriber; safe to call from every test.
pub fn install_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(default_filter())
        .try_init();
}
