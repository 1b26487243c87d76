//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use thiserror::Error;

/// Platform independent error conditions.
#[derive(Error, Debug)]
pub enum FocusError {
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(&'static str),
    #[error("Focus worker failed to start")]
    WorkerStartFailed,
}
