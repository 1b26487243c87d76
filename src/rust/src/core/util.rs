//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Utility helpers and types.

use std::sync::{Arc, Condvar, Mutex};

/// Generic Mutex/Condvar pair for signaling async event completion.  The
/// bool flips to true exactly once, when the value has been posted.
pub type FutureResult<T> = Arc<(Mutex<(bool, T)>, Condvar)>;
