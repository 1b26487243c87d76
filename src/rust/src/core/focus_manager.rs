//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Public entry point for connection-service focus arbitration.
//!
//! `FocusManager` owns the focus worker and translates collaborator
//! callbacks into events on it.  Producers may call in from any thread;
//! the worker serializes everything.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};

use static_assertions::assert_impl_all;

use crate::common::{
    CallState, Result,
    actor::{Actor, Stopper},
};
use crate::core::call_mutex::CallMutex;
use crate::core::focus::{
    Call, CallsManagerListener, CallsManagerRequester, ConnectionService,
    ConnectionServiceFocusListener, FocusConfig, FocusRequest,
    GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_ID, GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_MESSAGE,
    RequestFocusCallback,
};
use crate::core::focus_fsm::{FocusEvent, FocusHistory, FocusSnapshot, FocusState};
use crate::core::util::FutureResult;

/// Arbitrates the connection-service focus.  Cheap to clone; all clones
/// share the same worker.
#[derive(Clone)]
pub struct FocusManager {
    actor: Actor<FocusState>,
    snapshot: Arc<CallMutex<FocusSnapshot>>,
    history: Arc<CallMutex<FocusHistory>>,
    config: FocusConfig,
}

assert_impl_all!(FocusManager: Send);

impl FocusManager {
    /// Starts the focus worker and registers for call lifecycle with the
    /// calls manager.
    pub fn start(
        calls_manager: Box<dyn CallsManagerRequester>,
        config: FocusConfig,
    ) -> Result<Self> {
        let snapshot = Arc::new(CallMutex::new(FocusSnapshot::default(), "focus snapshot"));
        let history = Arc::new(CallMutex::new(FocusHistory::default(), "call focus history"));

        let config_for_state = config.clone();
        let snapshot_for_state = snapshot.clone();
        let history_for_state = history.clone();
        let actor = Actor::start(Stopper::new(), move |actor| {
            let calls_manager_listener = Arc::new(CallsManagerListenerAdapter {
                actor: actor.clone(),
            });
            let focus_listener = Arc::new(FocusListenerAdapter {
                actor: actor.clone(),
            });
            Ok(FocusState::new(
                config_for_state,
                calls_manager,
                calls_manager_listener,
                focus_listener,
                history_for_state,
                snapshot_for_state,
                actor,
            ))
        })?;
        Ok(Self {
            actor,
            snapshot,
            history,
            config,
        })
    }

    /// Asks for `call`'s connection service to take the focus.  The
    /// callback fires exactly once, when the transition has completed.
    pub fn request_focus(&self, call: Call, callback: Option<RequestFocusCallback>) {
        send_event(
            &self.actor,
            FocusEvent::RequestFocus(FocusRequest::new(call, callback)),
        );
    }

    /// The current focus call.
    ///
    /// On the worker thread this answers directly.  Anywhere else the read
    /// round-trips the event queue with a bounded wait and falls back to
    /// the last-observed value when the worker does not answer in time.
    pub fn current_focus_call(&self) -> Option<Call> {
        if self.actor.is_worker_thread() {
            return self.last_observed_focus_call();
        }

        let slot: FutureResult<Option<Call>> =
            Arc::new((Mutex::new((false, None)), Condvar::new()));
        send_event(&self.actor, FocusEvent::CurrentFocusQuery(slot.clone()));

        let (slot_mutex, slot_condvar) = &*slot;
        let guard = match slot_mutex.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("current_focus_call: query slot poisoned");
                return self.last_observed_focus_call();
            }
        };
        match slot_condvar.wait_timeout_while(guard, self.config.sync_read_timeout, |posted| {
            !posted.0
        }) {
            Ok((guard, timeout)) => {
                if timeout.timed_out() {
                    self.on_current_focus_call_timeout();
                    self.last_observed_focus_call()
                } else {
                    guard.1.clone()
                }
            }
            Err(_) => {
                warn!("current_focus_call: interrupted waiting for the focus worker");
                self.last_observed_focus_call()
            }
        }
    }

    /// The connection service holding the focus.  Unsynchronized read,
    /// possibly inaccurate when called off the worker thread.
    pub fn current_focus(&self) -> Option<ConnectionService> {
        match self.snapshot.lock() {
            Ok(snapshot) => snapshot.connection_service.clone(),
            Err(e) => {
                warn!("current_focus: {}", e);
                None
            }
        }
    }

    /// Writes the focus call history, newest last.
    pub fn dump(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "Call Focus History:")?;
        let history = self.history.lock()?;
        for entry in history.entries() {
            writeln!(w, "  {}", entry)?;
        }
        Ok(())
    }

    pub fn stopper(&self) -> &Stopper {
        self.actor.stopper()
    }

    fn last_observed_focus_call(&self) -> Option<Call> {
        match self.snapshot.lock() {
            Ok(snapshot) => snapshot.focus_call.clone(),
            Err(e) => {
                warn!("current_focus_call: {}", e);
                None
            }
        }
    }

    fn on_current_focus_call_timeout(&self) {
        if self.config.anomaly_report_on_focus_timeout {
            error!(
                "current_focus_call: no answer from the focus worker within {:?}",
                self.config.sync_read_timeout
            );
            self.dump_handler_state();
            if let Some(reporter) = &self.config.anomaly_reporter {
                reporter.report_anomaly(
                    GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_ID,
                    GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_MESSAGE,
                );
            }
        } else {
            warn!(
                "current_focus_call: no answer from the focus worker within {:?}, returning the last-observed value",
                self.config.sync_read_timeout
            );
        }
    }

    fn dump_handler_state(&self) {
        let (service, focus_call) = match self.snapshot.lock() {
            Ok(snapshot) => (
                snapshot
                    .connection_service
                    .as_ref()
                    .map(|service| service.component_name()),
                snapshot.focus_call.as_ref().map(|call| call.id()),
            ),
            Err(_) => (None, None),
        };
        error!(
            "current_focus_call: last-observed focus: {:?}, focus call: {:?}",
            service, focus_call
        );
        let mut dump = Vec::new();
        if self.dump(&mut dump).is_ok() {
            if let Ok(text) = String::from_utf8(dump) {
                for line in text.lines() {
                    error!("current_focus_call: {}", line);
                }
            }
        }
    }
}

fn send_event(actor: &Actor<FocusState>, event: FocusEvent) {
    actor.send(move |state| state.handle_event(event));
}

/// Installed on services that gain the focus; forwards their
/// acknowledgments onto the focus worker.
struct FocusListenerAdapter {
    actor: Actor<FocusState>,
}

impl ConnectionServiceFocusListener for FocusListenerAdapter {
    fn on_connection_service_released(&self, service: ConnectionService) {
        send_event(&self.actor, FocusEvent::ReleaseConnectionFocus(service));
    }

    fn on_connection_service_death(&self, service: ConnectionService) {
        send_event(&self.actor, FocusEvent::ConnectionServiceDeath(service));
    }
}

/// Receives call lifecycle from the calls manager.  Calls that are
/// external at notification time never reach the worker.
struct CallsManagerListenerAdapter {
    actor: Actor<FocusState>,
}

impl CallsManagerListener for CallsManagerListenerAdapter {
    fn on_call_added(&self, call: Call) {
        if call.is_external_call() {
            return;
        }
        send_event(&self.actor, FocusEvent::AddCall(call));
    }

    fn on_call_removed(&self, call: Call) {
        if call.is_external_call() {
            return;
        }
        send_event(&self.actor, FocusEvent::RemoveCall(call));
    }

    fn on_call_state_changed(&self, call: Call, old_state: CallState, new_state: CallState) {
        if call.is_external_call() {
            return;
        }
        send_event(
            &self.actor,
            FocusEvent::CallStateChanged {
                call,
                old_state,
                new_state,
            },
        );
    }

    fn on_external_call_changed(&self, call: Call, is_external: bool) {
        if is_external {
            send_event(&self.actor, FocusEvent::RemoveCall(call));
        } else {
            send_event(&self.actor, FocusEvent::AddCall(call));
        }
    }
}
