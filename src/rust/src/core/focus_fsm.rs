//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Connection-Service Focus Finite State Machine
//!
//! The focus FSM arbitrates which connection service holds the focus and
//! which of its calls is the focus call.  It consumes events serialized on
//! the focus worker; each handler runs to completion and leaves the focus
//! pair invariants intact.
//!
//! # Asynchronous Inputs:
//!
//! ## From the client application
//!
//! - RequestFocus
//!
//! ## From connection services
//!
//! - ReleaseConnectionFocus
//! - ConnectionServiceDeath
//!
//! ## From the calls manager
//!
//! - AddCall
//! - RemoveCall
//! - CallStateChanged
//!
//! ## From the internal runtime
//!
//! - ReleaseFocusTimeout
//! - CurrentFocusQuery

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::common::{CallState, actor::Actor};
use crate::core::call_mutex::CallMutex;
use crate::core::call_registry::CallRegistry;
use crate::core::focus::{
    CALL_FOCUS_HISTORY_SIZE, Call, CallsManagerListener, CallsManagerRequester, ConnectionService,
    ConnectionServiceFocusListener, FocusConfig, FocusRequest, NO_FOCUS_CALL_HISTORY_ENTRY,
    PRIORITY_FOCUS_CALL_STATES, same_call, same_connection_service,
};
use crate::core::util::FutureResult;

/// The different types of FocusEvents.
pub enum FocusEvent {
    /// A call asks for its connection service to take the focus.
    RequestFocus(FocusRequest),
    /// The focused service acknowledges that it released the focus.
    ReleaseConnectionFocus(ConnectionService),
    /// The release deadline armed for a hand-off elapsed.  Carries the
    /// arming generation; a stale generation means the deadline was
    /// canceled by a voluntary release.
    ReleaseFocusTimeout(u64),
    /// A connection service's hosting process died.
    ConnectionServiceDeath(ConnectionService),
    /// The calls manager started tracking a call.
    AddCall(Call),
    /// The calls manager stopped tracking a call.
    RemoveCall(Call),
    /// A tracked call changed state.
    CallStateChanged {
        call: Call,
        old_state: CallState,
        new_state: CallState,
    },
    /// Rendezvous for the bounded synchronous focus-call read.
    CurrentFocusQuery(FutureResult<Option<Call>>),
}

impl fmt::Display for FocusEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            FocusEvent::RequestFocus(request) => format!("RequestFocus, request: {}", request),
            FocusEvent::ReleaseConnectionFocus(service) => format!(
                "ReleaseConnectionFocus, service: {}",
                service.component_name()
            ),
            FocusEvent::ReleaseFocusTimeout(generation) => {
                format!("ReleaseFocusTimeout, generation: {}", generation)
            }
            FocusEvent::ConnectionServiceDeath(service) => format!(
                "ConnectionServiceDeath, service: {}",
                service.component_name()
            ),
            FocusEvent::AddCall(call) => format!("AddCall, call: {}", call.id()),
            FocusEvent::RemoveCall(call) => format!("RemoveCall, call: {}", call.id()),
            FocusEvent::CallStateChanged {
                call,
                old_state,
                new_state,
            } => format!(
                "CallStateChanged, call: {}, state: {} -> {}",
                call.id(),
                old_state,
                new_state
            ),
            FocusEvent::CurrentFocusQuery(_) => "CurrentFocusQuery".to_string(),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for FocusEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Fixed-capacity ring of focus call transitions, newest last.  An entry
/// is the id of the call that became the focus call, or
/// `NO_FOCUS_CALL_HISTORY_ENTRY` when the focus call was cleared.
pub struct FocusHistory {
    entries: VecDeque<String>,
}

impl FocusHistory {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(CALL_FOCUS_HISTORY_SIZE),
        }
    }

    pub fn record(&mut self, entry: String) {
        if self.entries.len() == CALL_FOCUS_HISTORY_SIZE {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FocusHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// The focus pair as last published by the worker.  Off-thread readers get
/// this, so the value may lag the worker by the events still in flight.
#[derive(Clone, Default)]
pub struct FocusSnapshot {
    pub connection_service: Option<ConnectionService>,
    pub focus_call: Option<Call>,
}

/// The state inside the focus worker.  All fields are read and mutated on
/// the worker thread only; `history` and `snapshot` are additionally
/// readable from outside through their mutexes.
pub struct FocusState {
    config: FocusConfig,
    registry: CallRegistry,
    current_focus: Option<ConnectionService>,
    current_focus_call: Option<Call>,
    pending_request: Option<FocusRequest>,
    // Monotonic id for armed release deadlines.  A deadline event whose
    // generation no longer matches lost a race with a voluntary release.
    release_timeout_generation: u64,
    armed_release_timeout: Option<u64>,
    calls_manager: Box<dyn CallsManagerRequester>,
    focus_listener: Arc<dyn ConnectionServiceFocusListener>,
    history: Arc<CallMutex<FocusHistory>>,
    snapshot: Arc<CallMutex<FocusSnapshot>>,
    actor: Actor<FocusState>,
}

impl FocusState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FocusConfig,
        mut calls_manager: Box<dyn CallsManagerRequester>,
        calls_manager_listener: Arc<dyn CallsManagerListener>,
        focus_listener: Arc<dyn ConnectionServiceFocusListener>,
        history: Arc<CallMutex<FocusHistory>>,
        snapshot: Arc<CallMutex<FocusSnapshot>>,
        actor: Actor<FocusState>,
    ) -> Self {
        calls_manager.set_calls_manager_listener(calls_manager_listener);
        Self {
            config,
            registry: CallRegistry::new(),
            current_focus: None,
            current_focus_call: None,
            pending_request: None,
            release_timeout_generation: 0,
            armed_release_timeout: None,
            calls_manager,
            focus_listener,
            history,
            snapshot,
            actor,
        }
    }

    pub fn handle_event(&mut self, event: FocusEvent) {
        info!("focus: rx event: {}", event);
        match event {
            FocusEvent::RequestFocus(request) => self.handle_request_focus(request),
            FocusEvent::ReleaseConnectionFocus(service) => {
                self.handle_release_connection_focus(service)
            }
            FocusEvent::ReleaseFocusTimeout(generation) => {
                self.handle_release_focus_timeout(generation)
            }
            FocusEvent::ConnectionServiceDeath(service) => {
                self.handle_connection_service_death(service)
            }
            FocusEvent::AddCall(call) => self.handle_add_call(call),
            FocusEvent::RemoveCall(call) => self.handle_remove_call(call),
            FocusEvent::CallStateChanged { call, .. } => self.handle_call_state_changed(call),
            FocusEvent::CurrentFocusQuery(slot) => self.handle_current_focus_query(slot),
        }
    }

    fn handle_request_focus(&mut self, request: FocusRequest) {
        let requester = request.call.connection_service();
        let current_keeps_focus = match &self.current_focus {
            None => true,
            Some(current) => same_connection_service(current, &requester),
        };
        if current_keeps_focus {
            self.update_connection_service_focus(Some(requester));
            self.update_current_focus_call();
            request.done();
            return;
        }

        // Hand-off: ask the focused service to let go and park the request
        // until it acknowledges or the deadline fires.
        if let Some(current) = &self.current_focus {
            current.focus_lost();
        }
        if self.pending_request.is_none() {
            self.arm_release_timeout();
        } else {
            // A newer request steals the pending slot.  The deadline armed
            // for the original request stays armed and completes this one.
            info!("focus: replacing the pending focus request with {}", request);
        }
        self.pending_request = Some(request);
    }

    fn handle_release_connection_focus(&mut self, service: ConnectionService) {
        if !self.holds_focus(&service) {
            info!(
                "focus: release from non-focused service {}, ignoring",
                service.component_name()
            );
            return;
        }
        self.armed_release_timeout = None;
        let pending = self.pending_request.take();
        let next_focus = pending
            .as_ref()
            .map(|request| request.call.connection_service());
        self.update_connection_service_focus(next_focus);
        self.update_current_focus_call();
        if let Some(request) = pending {
            request.done();
        }
    }

    fn handle_release_focus_timeout(&mut self, generation: u64) {
        if self.armed_release_timeout != Some(generation) {
            debug!("focus: release deadline {} was canceled", generation);
            return;
        }
        self.armed_release_timeout = None;
        match self.pending_request.take() {
            Some(request) => {
                if let Some(current) = self.current_focus.clone() {
                    warn!(
                        "focus: {} did not release the focus in time, forcing release",
                        current.component_name()
                    );
                    self.calls_manager.release_connection_service(current);
                }
                // The outgoing service is presumed unhealthy; it already
                // got focus_lost() and is not notified again.
                self.update_connection_service_focus(Some(request.call.connection_service()));
                self.update_current_focus_call();
                request.done();
            }
            None => {
                error!("focus: release deadline fired with no pending request");
            }
        }
    }

    fn handle_connection_service_death(&mut self, service: ConnectionService) {
        if !self.holds_focus(&service) {
            info!(
                "focus: death of non-focused service {}, ignoring",
                service.component_name()
            );
            return;
        }
        // The dead service gets no further calls.  A pending hand-off
        // stays pending until its release deadline fires.
        self.update_connection_service_focus(None);
        self.update_current_focus_call();
    }

    fn handle_add_call(&mut self, call: Call) {
        if !self.registry.add(call.clone()) {
            debug!("focus: call {} is already tracked", call.id());
        }
        if self.holds_focus(&call.connection_service()) {
            self.update_current_focus_call();
        }
    }

    fn handle_remove_call(&mut self, call: Call) {
        self.registry.remove(&call);
        let was_focus_call = matches!(
            &self.current_focus_call, Some(focus_call) if same_call(focus_call, &call)
        );
        if was_focus_call {
            self.update_current_focus_call();
        }
    }

    fn handle_call_state_changed(&mut self, call: Call) {
        if self.registry.contains(&call) && self.holds_focus(&call.connection_service()) {
            self.update_current_focus_call();
        }
    }

    fn handle_current_focus_query(&mut self, slot: FutureResult<Option<Call>>) {
        let (slot_mutex, slot_condvar) = &*slot;
        match slot_mutex.lock() {
            Ok(mut guard) => {
                guard.0 = true;
                guard.1 = self.current_focus_call.clone();
                slot_condvar.notify_one();
            }
            Err(_) => warn!("focus: focus query slot poisoned"),
        }
    }

    /// Moves the connection-service focus to `new_focus` and notifies the
    /// incoming service.  The outgoing service already got `focus_lost()`
    /// while the request was pending, so it is not notified here.
    fn update_connection_service_focus(&mut self, new_focus: Option<ConnectionService>) {
        if same_service_opt(&self.current_focus, &new_focus) {
            return;
        }
        if let Some(service) = &new_focus {
            service.set_focus_listener(self.focus_listener.clone());
            service.focus_gained();
        }
        debug!(
            "focus: connection service focus: {} -> {}",
            service_name(&self.current_focus),
            service_name(&new_focus),
        );
        self.current_focus = new_focus;
        self.publish_snapshot();
    }

    /// Recomputes the focus call: the first focusable call of the focused
    /// service, in registry order, whose state has focus priority.
    fn update_current_focus_call(&mut self) {
        let previous_focus_call = self.current_focus_call.take();
        let Some(current_focus) = self.current_focus.clone() else {
            debug!("focus: no connection service holds the focus");
            self.publish_snapshot();
            return;
        };
        self.current_focus_call = self
            .registry
            .focusable_calls_for(&current_focus)
            .find(|call| PRIORITY_FOCUS_CALL_STATES.contains(&call.state()))
            .cloned();
        if !same_call_opt(&previous_focus_call, &self.current_focus_call) {
            let entry = match &self.current_focus_call {
                Some(call) => call.id(),
                None => NO_FOCUS_CALL_HISTORY_ENTRY.to_string(),
            };
            info!("focus: focus call is now {}", entry);
            match self.history.lock() {
                Ok(mut history) => history.record(entry),
                Err(e) => warn!("focus: {}", e),
            }
        }
        self.publish_snapshot();
    }

    fn arm_release_timeout(&mut self) {
        self.release_timeout_generation += 1;
        let generation = self.release_timeout_generation;
        self.armed_release_timeout = Some(generation);
        self.actor
            .send_delayed(self.config.release_timeout, move |state| {
                state.handle_event(FocusEvent::ReleaseFocusTimeout(generation))
            });
    }

    fn holds_focus(&self, service: &ConnectionService) -> bool {
        matches!(&self.current_focus, Some(current) if same_connection_service(current, service))
    }

    fn publish_snapshot(&self) {
        match self.snapshot.lock() {
            Ok(mut snapshot) => {
                snapshot.connection_service = self.current_focus.clone();
                snapshot.focus_call = self.current_focus_call.clone();
            }
            Err(e) => warn!("focus: {}", e),
        }
    }
}

fn service_name(service: &Option<ConnectionService>) -> String {
    match service {
        Some(service) => service.component_name(),
        None => "<none>".to_string(),
    }
}

fn same_service_opt(a: &Option<ConnectionService>, b: &Option<ConnectionService>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_connection_service(a, b),
        _ => false,
    }
}

fn same_call_opt(a: &Option<Call>, b: &Option<Call>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_call(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keeps_newest_entries() {
        let mut history = FocusHistory::new();
        assert!(history.is_empty());

        for n in 0..CALL_FOCUS_HISTORY_SIZE + 5 {
            history.record(format!("TC@{}", n));
        }

        assert_eq!(CALL_FOCUS_HISTORY_SIZE, history.len());
        let entries: Vec<&str> = history.entries().collect();
        assert_eq!("TC@5", entries[0]);
        assert_eq!(
            format!("TC@{}", CALL_FOCUS_HISTORY_SIZE + 4),
            entries[entries.len() - 1]
        );
    }

    #[test]
    fn history_records_clears_verbatim() {
        let mut history = FocusHistory::new();
        history.record("TC@1".to_string());
        history.record(NO_FOCUS_CALL_HISTORY_ENTRY.to_string());

        let entries: Vec<&str> = history.entries().collect();
        assert_eq!(vec!["TC@1", NO_FOCUS_CALL_HISTORY_ENTRY], entries);
    }
}
