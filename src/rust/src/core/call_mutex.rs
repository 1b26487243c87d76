//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Wrapper around `std::sync::Mutex::lock()` that consumes the poison
//! error and returns a labeled crate error instead.

use std::sync::{Mutex, MutexGuard};

use crate::common::Result;
use crate::error::FocusError;

pub struct CallMutex<T: ?Sized> {
    /// Human readable label for the mutex, used in the poison error.
    label: &'static str,
    mutex: Mutex<T>,
}

impl<T> CallMutex<T> {
    pub fn new(t: T, label: &'static str) -> CallMutex<T> {
        CallMutex {
            mutex: Mutex::new(t),
            label,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(FocusError::MutexPoisoned(self.label).into()),
        }
    }
}
