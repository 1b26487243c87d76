//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # CallFocus -- Connection-Service Focus Arbitration
//!
//! This crate arbitrates an exclusive capability token, the
//! *connection-service focus*, among competing calls owned by different
//! connection services in a telephony stack.  Only one connection service
//! may hold focus at a time, and within that service exactly one call is
//! the focus call.  All transitions are serialized on a single worker
//! thread; a connection service that fails to release focus on request is
//! forcibly torn down after a hard timeout.

#[macro_use]
extern crate log;

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod call_mutex;
    pub mod call_registry;
    pub mod focus;
    pub mod focus_fsm;
    pub mod focus_manager;
    pub mod util;
}
