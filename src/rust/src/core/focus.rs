//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Connection-Service Focus
//!
//! The trait seams between the focus manager and its collaborators: the
//! connection services that gain and lose focus, the calls they own, and
//! the calls manager that can forcibly tear a service down.  Collaborator
//! handles are shared by reference and never mutated by the manager.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::{Uuid, uuid};

use crate::common::CallState;

/// How long a connection service has to acknowledge `focus_lost()` before
/// it is forcibly released through the calls manager.
pub const RELEASE_FOCUS_TIMEOUT: Duration = Duration::from_millis(5000);

/// Bound on the off-thread synchronous read of the current focus call.
pub const GET_CURRENT_FOCUS_TIMEOUT: Duration = Duration::from_millis(1000);

/// Capacity of the focus call history ring.
pub const CALL_FOCUS_HISTORY_SIZE: usize = 20;

/// History entry recorded when the focus call is cleared after having been
/// set.
pub const NO_FOCUS_CALL_HISTORY_ENTRY: &str = "<none>";

/// Anomaly reported when a synchronous focus-call read times out and
/// anomaly reporting is enabled.
pub const GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_ID: Uuid =
    uuid!("f7b2c8e1-5a04-4f36-9f02-6d1c3a8e2b47");
pub const GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_MESSAGE: &str =
    "Timed out reading the current focus call from the focus worker";

/// Call states eligible to be the focus call.  Selection among eligible
/// calls is by registry insertion order, not by position in this list.
pub const PRIORITY_FOCUS_CALL_STATES: &[CallState] = &[
    CallState::Active,
    CallState::Connecting,
    CallState::Dialing,
    CallState::AudioProcessing,
    CallState::Ringing,
];

/// A connection service competing for the focus.
pub trait ConnectionServiceFocus: Send + Sync {
    /// The service now holds the connection-service focus.
    fn focus_gained(&self);

    /// The service must release the focus and acknowledge through its
    /// listener once done.
    fn focus_lost(&self);

    fn set_focus_listener(&self, listener: Arc<dyn ConnectionServiceFocusListener>);

    /// Identity of the service.  Two handles with the same component name
    /// are the same service.
    fn component_name(&self) -> String;
}

/// A call as seen by the focus manager.
pub trait CallFocus: Send + Sync {
    /// The connection service that owns this call.
    fn connection_service(&self) -> ConnectionService;

    fn state(&self) -> CallState;

    /// Whether this call may be selected as the focus call at all.
    fn is_focusable(&self) -> bool;

    fn id(&self) -> String;

    /// External calls are visible on this device but hosted elsewhere;
    /// they never participate in focus arbitration.
    fn is_external_call(&self) -> bool;
}

/// Installed on a connection service when it gains focus; the service
/// reports back through it.
pub trait ConnectionServiceFocusListener: Send + Sync {
    /// The service voluntarily released the focus.
    fn on_connection_service_released(&self, service: ConnectionService);

    /// The service's hosting process died.
    fn on_connection_service_death(&self, service: ConnectionService);
}

/// Given to the calls manager so call lifecycle reaches the focus manager.
pub trait CallsManagerListener: Send + Sync {
    fn on_call_added(&self, call: Call);
    fn on_call_removed(&self, call: Call);
    fn on_call_state_changed(&self, call: Call, old_state: CallState, new_state: CallState);
    fn on_external_call_changed(&self, call: Call, is_external: bool);
}

/// The calls manager operations the focus manager needs.
pub trait CallsManagerRequester: Send {
    /// Forcibly tears down a service that did not release the focus when
    /// asked.
    fn release_connection_service(&mut self, service: ConnectionService);

    fn set_calls_manager_listener(&mut self, listener: Arc<dyn CallsManagerListener>);
}

/// External sink for anomaly reports.
pub trait AnomalyReporter: Send + Sync {
    fn report_anomaly(&self, id: Uuid, message: &str);
}

/// Shared handle to a connection service.
pub type ConnectionService = Arc<dyn ConnectionServiceFocus>;

/// Shared handle to a call.  Call equality is handle identity.
pub type Call = Arc<dyn CallFocus>;

/// One-shot completion for an accepted focus request, invoked with the
/// request's call.
pub type RequestFocusCallback = Box<dyn FnOnce(Call) + Send>;

/// Connection services are equal by component identity.
pub fn same_connection_service(a: &ConnectionService, b: &ConnectionService) -> bool {
    a.component_name() == b.component_name()
}

/// Calls are equal by handle identity.
pub fn same_call(a: &Call, b: &Call) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}

/// A request for a call's connection service to take the focus.
pub struct FocusRequest {
    pub call: Call,
    callback: Option<RequestFocusCallback>,
}

impl FocusRequest {
    pub fn new(call: Call, callback: Option<RequestFocusCallback>) -> Self {
        Self { call, callback }
    }

    /// Completes the request.  Each accepted request is completed exactly
    /// once.
    pub fn done(self) {
        if let Some(callback) = self.callback {
            callback(self.call);
        }
    }
}

impl fmt::Display for FocusRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(call: {})", self.call.id())
    }
}

/// Tunables for the focus manager.  The defaults are the production
/// values; tests shorten the deadlines.
#[derive(Clone)]
pub struct FocusConfig {
    pub release_timeout: Duration,
    pub sync_read_timeout: Duration,
    /// When set, a timed-out synchronous read also dumps handler state and
    /// reports `GET_CURRENT_FOCUS_TIMEOUT_ANOMALY_ID`.
    pub anomaly_report_on_focus_timeout: bool,
    pub anomaly_reporter: Option<Arc<dyn AnomalyReporter>>,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            release_timeout: RELEASE_FOCUS_TIMEOUT,
            sync_read_timeout: GET_CURRENT_FOCUS_TIMEOUT,
            anomaly_report_on_focus_timeout: false,
            anomaly_reporter: None,
        }
    }
}
