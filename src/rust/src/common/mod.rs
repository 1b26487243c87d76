//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::fmt;

pub mod actor;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Tracks the state of a call as reported by the calls manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// No activity on the call yet.
    Idle,
    /// The call is being set up with its connection service.
    Connecting,
    /// Outgoing call is dialing the remote party.
    Dialing,
    /// Incoming call is ringing locally.
    Ringing,
    /// The call audio is routed to a screening service.
    AudioProcessing,
    /// The call is connected and active.
    Active,
    /// The call is on hold.
    OnHold,
    /// The call is in the process of hanging up.
    Disconnecting,
    /// The call has ended.
    Disconnected,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
