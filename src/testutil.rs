// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

//! Test-only global setup, matching the teacher's `testutil::init()`
//! pattern: a handful of tests that want to see `debug!`/`warn!` output
//! (resync, codec fallback, fragment remapping) call this once per process.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs `env_logger` at `debug` level unless `RUST_LOG` already names a
/// filter. Safe to call from every test that wants log output; only the
/// first call does anything.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).try_init();
    });
}
