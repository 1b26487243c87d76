//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A small single-threaded actor: one worker thread draining a FIFO of
//! tasks, plus a facility for tasks that run after a delay.  All state
//! owned by the actor is mutated on the worker thread only, which is what
//! gives the focus state machine its serialization guarantee.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{self, AtomicBool},
        mpsc::{Receiver, RecvTimeoutError, Sender, channel},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crate::common::Result;
use crate::error::FocusError;

pub struct Actor<State> {
    sender: Sender<Task<State>>,
    stopper: Stopper,
    // Set by the worker before it runs anything, so a task that calls back
    // into the actor's owner can be recognized as already being serialized.
    worker_id: Arc<OnceLock<ThreadId>>,
}

impl<State: 'static> Actor<State> {
    /// Spawns the worker thread and constructs the state on it.  Does not
    /// return until the state constructor has run; a constructor error is
    /// returned here and the worker exits.
    pub fn start(
        stopper: Stopper,
        gen_state: impl FnOnce(Actor<State>) -> Result<State> + Send + 'static,
    ) -> Result<Self> {
        let (sender, receiver) = channel::<Task<State>>();
        let (started_sender, started_receiver) = channel::<Result<()>>();

        let stopped = Arc::new(AtomicBool::new(false));
        let worker_id = Arc::new(OnceLock::new());

        let actor = Self {
            sender,
            stopper: stopper.clone(),
            worker_id: worker_id.clone(),
        };
        let actor_for_worker = actor.clone();
        let stopped_for_worker = stopped.clone();
        let join_handle = thread::spawn(move || {
            let _ = worker_id.set(thread::current().id());
            let mut state = match gen_state(actor_for_worker) {
                Ok(state) => {
                    let _ = started_sender.send(Ok(()));
                    state
                }
                Err(e) => {
                    let _ = started_sender.send(Err(e));
                    return;
                }
            };
            Self::run_worker(&receiver, &stopped_for_worker, &mut state);
        });
        stopper.register(Box::new(actor.clone()), stopped, join_handle);

        started_receiver
            .recv()
            .map_err(|_| FocusError::WorkerStartFailed)??;
        Ok(actor)
    }

    fn run_worker(receiver: &Receiver<Task<State>>, stopped: &AtomicBool, state: &mut State) {
        let mut delayed_tasks = BinaryHeap::<Task<State>>::new();
        loop {
            let task = match delayed_tasks.peek() {
                // Nothing scheduled, wait forever for the next task.
                None => match receiver.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                },
                Some(next_due) => match receiver.recv_timeout(next_due.due_in()) {
                    Ok(task) => task,
                    // The deadline passed, run the scheduled task now.
                    Err(RecvTimeoutError::Timeout) => delayed_tasks.pop().unwrap().into_due(),
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };
            if stopped.load(atomic::Ordering::Relaxed) {
                break;
            }
            if task.is_delayed() {
                delayed_tasks.push(task);
            } else {
                (task.run)(state);
            }
        }
    }

    /// Enqueues a task to run on the worker thread.  Tasks sent from the
    /// same thread run in the order they were sent.
    pub fn send(&self, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Task::immediate(Box::new(run)));
    }

    /// Enqueues a task to run on the worker thread once `delay` has
    /// elapsed.
    pub fn send_delayed(&self, delay: Duration, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Task::delayed(Box::new(run), delay));
    }

    /// True when called from this actor's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        self.worker_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }
}

// This doesn't #[derive] because State isn't Clone.
impl<State> Clone for Actor<State> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopper: self.stopper.clone(),
            worker_id: self.worker_id.clone(),
        }
    }
}

impl<State> Stop for Actor<State> {
    fn stop(&self, stopped: &AtomicBool) {
        stopped.store(true, atomic::Ordering::Relaxed);
        // An empty task kicks the worker loop if it's blocked on recv.
        let _ = self.sender.send(Task::immediate(Box::new(|_state| {})));
    }
}

type TaskFn<State> = Box<dyn FnOnce(&mut State) + Send>;

struct Task<State> {
    run: TaskFn<State>,
    // None runs as soon as it is dequeued.
    due_at: Option<Instant>,
}

impl<State> Task<State> {
    fn immediate(run: TaskFn<State>) -> Self {
        Self { run, due_at: None }
    }

    fn delayed(run: TaskFn<State>, delay: Duration) -> Self {
        Self {
            run,
            due_at: Some(Instant::now() + delay),
        }
    }

    fn into_due(self) -> Self {
        Self {
            run: self.run,
            due_at: None,
        }
    }

    fn is_delayed(&self) -> bool {
        self.due_at.is_some()
    }

    fn due_in(&self) -> Duration {
        match self.due_at {
            None => Duration::from_secs(0),
            Some(due_at) => due_at.saturating_duration_since(Instant::now()),
        }
    }
}

impl<State> Ord for Task<State> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the earliest deadline surfaces first in a BinaryHeap.
        self.due_at.cmp(&other.due_at).reverse()
    }
}

impl<State> PartialOrd for Task<State> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<State> PartialEq for Task<State> {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at
    }
}

impl<State> Eq for Task<State> {}

trait Stop: Send {
    fn stop(&self, stopped: &AtomicBool);
}

/// Stops all the actors registered with it, in one shot.  One Stopper can
/// be shared across many actors; stopping also joins the worker threads,
/// which a cloneable actor handle could not do on its own.
#[derive(Clone)]
pub struct Stopper {
    actors: Arc<Mutex<Vec<(Box<dyn Stop>, Arc<AtomicBool>, thread::JoinHandle<()>)>>>,
}

impl Stopper {
    pub fn new() -> Self {
        Self {
            actors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn register(
        &self,
        actor: Box<dyn Stop>,
        stopped: Arc<AtomicBool>,
        join_handle: thread::JoinHandle<()>,
    ) {
        let mut actors = self.actors.lock().expect("Couldn't get lock to add actor");
        actors.push((actor, stopped, join_handle));
    }

    /// Stops all the actors associated with this Stopper without waiting
    /// for their worker threads to end.
    pub fn stop_all_without_joining(&self) -> Vec<thread::JoinHandle<()>> {
        let mut actors = self
            .actors
            .lock()
            .expect("Couldn't get lock to stop actors");
        actors
            .drain(..)
            .map(|(actor, stopped, join_handle)| {
                actor.stop(&stopped);
                join_handle
            })
            .collect()
    }

    /// Stops all the actors associated with this Stopper and waits for
    /// their worker threads to end.
    pub fn stop_all_and_join(&self) {
        let join_handles = self.stop_all_without_joining();
        for join_handle in join_handles {
            join_handle.join().expect("Failed to join worker thread.");
        }
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    struct TestState {
        values: Vec<u32>,
        done: mpsc::Sender<Vec<u32>>,
    }

    fn start_test_actor(done: mpsc::Sender<Vec<u32>>) -> Actor<TestState> {
        Actor::start(Stopper::new(), move |_actor| {
            Ok(TestState {
                values: Vec::new(),
                done,
            })
        })
        .expect("start test actor")
    }

    #[test]
    fn tasks_run_in_send_order() {
        let (done_sender, done_receiver) = mpsc::channel();
        let actor = start_test_actor(done_sender);

        for value in 1..=3 {
            actor.send(move |state| state.values.push(value));
        }
        actor.send(|state| {
            let _ = state.done.send(state.values.clone());
        });

        assert_eq!(vec![1, 2, 3], done_receiver.recv().expect("values"));
        actor.stopper().stop_all_and_join();
    }

    #[test]
    fn delayed_task_runs_after_immediate_tasks() {
        let (done_sender, done_receiver) = mpsc::channel();
        let actor = start_test_actor(done_sender);

        actor.send_delayed(Duration::from_millis(50), |state| {
            state.values.push(99);
            let _ = state.done.send(state.values.clone());
        });
        actor.send(|state| state.values.push(1));
        actor.send(|state| state.values.push(2));

        assert_eq!(vec![1, 2, 99], done_receiver.recv().expect("values"));
        actor.stopper().stop_all_and_join();
    }

    #[test]
    fn delayed_tasks_fire_in_deadline_order() {
        let (done_sender, done_receiver) = mpsc::channel();
        let actor = start_test_actor(done_sender);

        actor.send_delayed(Duration::from_millis(80), |state| {
            state.values.push(2);
            let _ = state.done.send(state.values.clone());
        });
        actor.send_delayed(Duration::from_millis(20), |state| state.values.push(1));

        assert_eq!(vec![1, 2], done_receiver.recv().expect("values"));
        actor.stopper().stop_all_and_join();
    }

    #[test]
    fn recognizes_its_worker_thread() {
        let (done_sender, _done_receiver) = mpsc::channel();
        let actor = start_test_actor(done_sender);
        assert!(!actor.is_worker_thread());

        let (on_worker_sender, on_worker_receiver) = mpsc::channel();
        let actor_for_task = actor.clone();
        actor.send(move |_state| {
            let _ = on_worker_sender.send(actor_for_task.is_worker_thread());
        });

        assert!(on_worker_receiver.recv().expect("checked on worker"));
        actor.stopper().stop_all_and_join();
    }

    #[test]
    fn start_surfaces_state_constructor_errors() {
        let result: Result<Actor<TestState>> = Actor::start(Stopper::new(), |_actor| {
            Err(FocusError::WorkerStartFailed.into())
        });
        assert!(result.is_err());
    }
}
