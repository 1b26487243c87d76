//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The set of calls the focus manager tracks.  Iteration order is
//! insertion order, which is what breaks ties when several calls of the
//! focused service are eligible to be the focus call.

use crate::core::focus::{Call, ConnectionService, same_call, same_connection_service};

/// Ordered set of tracked calls.  Mutated on the focus worker only.
#[derive(Default)]
pub struct CallRegistry {
    calls: Vec<Call>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self { calls: Vec::new() }
    }

    /// Appends the call unless it is already tracked.  Returns whether the
    /// call was added.
    pub fn add(&mut self, call: Call) -> bool {
        if self.contains(&call) {
            return false;
        }
        self.calls.push(call);
        true
    }

    /// Removes the first handle matching the call, if any.  Returns
    /// whether the call was tracked.
    pub fn remove(&mut self, call: &Call) -> bool {
        match self
            .calls
            .iter()
            .position(|tracked| same_call(tracked, call))
        {
            Some(index) => {
                self.calls.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.calls.iter().any(|tracked| same_call(tracked, call))
    }

    /// The focusable calls owned by `service`, in insertion order.
    pub fn focusable_calls_for<'a>(
        &'a self,
        service: &'a ConnectionService,
    ) -> impl Iterator<Item = &'a Call> {
        self.calls.iter().filter(move |call| {
            call.is_focusable() && same_connection_service(&call.connection_service(), service)
        })
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::CallState;
    use crate::core::focus::{CallFocus, ConnectionServiceFocus, ConnectionServiceFocusListener};

    struct TestService(&'static str);

    impl ConnectionServiceFocus for TestService {
        fn focus_gained(&self) {}
        fn focus_lost(&self) {}
        fn set_focus_listener(&self, _listener: Arc<dyn ConnectionServiceFocusListener>) {}
        fn component_name(&self) -> String {
            self.0.to_string()
        }
    }

    struct TestCall {
        id: &'static str,
        service: Arc<TestService>,
        focusable: bool,
    }

    impl CallFocus for TestCall {
        fn connection_service(&self) -> ConnectionService {
            self.service.clone()
        }
        fn state(&self) -> CallState {
            CallState::Active
        }
        fn is_focusable(&self) -> bool {
            self.focusable
        }
        fn id(&self) -> String {
            self.id.to_string()
        }
        fn is_external_call(&self) -> bool {
            false
        }
    }

    fn call(id: &'static str, service: &Arc<TestService>, focusable: bool) -> Call {
        Arc::new(TestCall {
            id,
            service: service.clone(),
            focusable,
        })
    }

    #[test]
    fn add_rejects_duplicates() {
        let service = Arc::new(TestService("sim"));
        let c1 = call("c1", &service, true);

        let mut registry = CallRegistry::new();
        assert!(registry.add(c1.clone()));
        assert!(!registry.add(c1.clone()));
        assert_eq!(1, registry.len());
        assert!(registry.contains(&c1));
    }

    #[test]
    fn remove_of_unknown_call_is_a_noop() {
        let service = Arc::new(TestService("sim"));
        let c1 = call("c1", &service, true);
        let c2 = call("c2", &service, true);

        let mut registry = CallRegistry::new();
        assert!(registry.add(c1.clone()));
        assert!(!registry.remove(&c2));
        assert_eq!(1, registry.len());
        assert!(registry.remove(&c1));
        assert!(registry.is_empty());
    }

    #[test]
    fn membership_is_by_handle_identity_not_id() {
        let service = Arc::new(TestService("sim"));
        let c1 = call("c1", &service, true);
        let c1_twin = call("c1", &service, true);

        let mut registry = CallRegistry::new();
        assert!(registry.add(c1.clone()));
        // Same id, different handle: a distinct call.
        assert!(registry.add(c1_twin.clone()));
        assert_eq!(2, registry.len());
    }

    #[test]
    fn focusable_calls_keep_insertion_order_and_filter() {
        let sim = Arc::new(TestService("sim"));
        let voip = Arc::new(TestService("voip"));
        let c1 = call("c1", &sim, true);
        let c2 = call("c2", &voip, true);
        let c3 = call("c3", &sim, false);
        let c4 = call("c4", &sim, true);

        let mut registry = CallRegistry::new();
        for c in [&c1, &c2, &c3, &c4] {
            assert!(registry.add(c.clone()));
        }

        let sim_service: ConnectionService = sim.clone();
        let ids: Vec<String> = registry
            .focusable_calls_for(&sim_service)
            .map(|c| c.id())
            .collect();
        assert_eq!(vec!["c1".to_string(), "c4".to_string()], ids);
    }
}
