//! Cooperative event dispatcher.
//!
//! All deferred work in the client runs through here: timed events kept in
//! an indexed min-heap keyed by their target step, and single-shot
//! continuations waiting for readiness on a socket. Handles receive the
//! owning context mutably, so the dispatcher itself lives inside that
//! context and is driven through the free functions [`step`] and
//! [`update_event_on_socket`].

mod heap;

use log::{error, trace};
use mio::Interest;

use crate::state::{Result, State};

use heap::TimeHeap;
pub use heap::TimeEventId;

/// A deferred unit of work.
pub type Handle<C> = Box<dyn FnOnce(&mut C) -> State>;

/// Identifier of a registered socket. Doubles as its `mio::Token`.
pub type Fd = usize;

/// Access to the dispatcher embedded in a context.
pub trait Dispatch: Sized + 'static {
    fn dispatcher(&mut self) -> &mut EventDispatcher<Self>;
}

struct SocketEntry<C> {
    fd: Fd,
    interest: Option<Interest>,
    handle: Option<Handle<C>>,
}

/// Timed events plus socket continuations.
pub struct EventDispatcher<C> {
    heap: TimeHeap<Handle<C>>,
    sockets: Vec<SocketEntry<C>>,
    current_step: i64,
    next_id: u64,
    max_events: usize,
    stopped: bool,
}

impl<C> EventDispatcher<C> {
    /// Create a dispatcher holding at most `max_events` pending events.
    pub fn new(max_events: usize) -> Self {
        Self {
            heap: TimeHeap::new(),
            sockets: Vec::new(),
            current_step: 0,
            next_id: 0,
            max_events,
            stopped: false,
        }
    }

    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    /// Run `handle` `delta` steps after the current step.
    ///
    /// Called from inside a handle with `delta == 0`, the new event still
    /// runs within the ongoing [`step`].
    pub fn execute_in(&mut self, handle: Handle<C>, delta: i64) -> Result<TimeEventId> {
        if self.heap.len() >= self.max_events {
            return Err(State::NoMoreResourceAvailable);
        }
        let id = TimeEventId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let target = self.current_step.wrapping_add(delta.max(0));
        self.heap.push(target, id, handle);
        Ok(id)
    }

    /// Run `handle` on the next step.
    pub fn execute(&mut self, handle: Handle<C>) -> Result<TimeEventId> {
        self.execute_in(handle, 0)
    }

    /// Drop a pending event without running it.
    pub fn cancel(&mut self, id: TimeEventId) -> Result<()> {
        self.heap.remove(id).map(drop).ok_or(State::ElementNotFound)
    }

    /// Move a pending event to `delta` steps from now.
    pub fn restart(&mut self, id: TimeEventId, delta: i64) -> Result<()> {
        let target = self.current_step.wrapping_add(delta.max(0));
        if self.heap.reschedule(id, target) {
            Ok(())
        } else {
            Err(State::ElementNotFound)
        }
    }

    pub fn is_pending(&self, id: TimeEventId) -> bool {
        self.heap.contains(id)
    }

    pub fn pending_events(&self) -> usize {
        self.heap.len()
    }

    /// Steps until the earliest pending event, zero if one is already due.
    pub fn next_event_in(&self) -> Option<i64> {
        self.heap
            .peek()
            .map(|entry| entry.step.wrapping_sub(self.current_step).max(0))
    }

    pub fn register_socket_fd(&mut self, fd: Fd) -> Result<()> {
        if self.sockets.iter().any(|entry| entry.fd == fd) {
            return Err(State::InvalidParameter);
        }
        self.sockets.push(SocketEntry {
            fd,
            interest: None,
            handle: None,
        });
        Ok(())
    }

    /// Forget `fd` and drop its pending continuation, if any.
    pub fn unregister_socket_fd(&mut self, fd: Fd) -> Result<()> {
        let index = self
            .sockets
            .iter()
            .position(|entry| entry.fd == fd)
            .ok_or(State::FdHandlerNotFound)?;
        self.sockets.swap_remove(index);
        Ok(())
    }

    /// Wait for `interest` on `fd`, then run `handle` once. Replaces any
    /// continuation already waiting on the same descriptor.
    pub fn continue_when_evt_on_socket(
        &mut self,
        fd: Fd,
        interest: Interest,
        handle: Handle<C>,
    ) -> Result<()> {
        let entry = self
            .sockets
            .iter_mut()
            .find(|entry| entry.fd == fd)
            .ok_or(State::FdHandlerNotFound)?;
        entry.interest = Some(interest);
        entry.handle = Some(handle);
        Ok(())
    }

    /// Interest of the continuation currently waiting on `fd`.
    pub fn socket_interest(&self, fd: Fd) -> Option<Interest> {
        self.sockets
            .iter()
            .find(|entry| entry.fd == fd)
            .and_then(|entry| entry.interest)
    }

    pub fn registered_fds(&self) -> usize {
        self.sockets.len()
    }

    /// Ask the processing loop to return.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn resume(&mut self) {
        self.stopped = false;
    }

    /// Drop every pending event and continuation.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.sockets.clear();
    }

    fn pop_due(&mut self) -> Option<Handle<C>> {
        let due = self.heap.peek()?.step.wrapping_sub(self.current_step) <= 0;
        if !due {
            return None;
        }
        self.heap.pop().map(|entry| entry.value)
    }
}

/// Advance the dispatcher to `to_step` and run every event due by then.
///
/// Events run in target-step order, first-in first-out within one step.
/// A fatal state returned by a handle stops the dispatcher and is returned.
pub fn step<C: Dispatch>(cx: &mut C, to_step: i64) -> State {
    cx.dispatcher().current_step = to_step;
    while let Some(handle) = cx.dispatcher().pop_due() {
        let state = handle(cx);
        if state.is_fatal() {
            error!("dispatcher stopped on fatal state: {}", state);
            cx.dispatcher().stop();
            return state;
        }
    }
    State::Ok
}

/// Run the continuation waiting on `fd`, consuming it.
pub fn update_event_on_socket<C: Dispatch>(cx: &mut C, fd: Fd) -> State {
    let dispatcher = cx.dispatcher();
    let Some(entry) = dispatcher.sockets.iter_mut().find(|entry| entry.fd == fd) else {
        return State::FdHandlerNotFound;
    };
    let Some(handle) = entry.handle.take() else {
        trace!("readiness on fd {} with nothing waiting", fd);
        return State::Ok;
    };
    entry.interest = None;
    handle(cx)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        dispatcher: EventDispatcher<Harness>,
        log: Vec<u32>,
    }

    impl Dispatch for Harness {
        fn dispatcher(&mut self) -> &mut EventDispatcher<Self> {
            &mut self.dispatcher
        }
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dispatcher: EventDispatcher::new(64),
                log: Vec::new(),
            }
        }

        fn record(&mut self, value: u32, delta: i64) -> TimeEventId {
            self.dispatcher
                .execute_in(
                    Box::new(move |h: &mut Harness| {
                        h.log.push(value);
                        State::Ok
                    }),
                    delta,
                )
                .unwrap()
        }
    }

    #[test]
    fn test_events_run_in_step_order() {
        let mut h = Harness::new();
        h.record(3, 3);
        h.record(1, 1);
        h.record(2, 2);
        h.record(4, 3);
        step(&mut h, 3);
        assert_eq!(h.log, vec![1, 2, 3, 4]);
        assert_eq!(h.dispatcher.pending_events(), 0);
    }

    #[test]
    fn test_ties_are_fifo() {
        let mut h = Harness::new();
        for value in 0..5 {
            h.record(value, 2);
        }
        step(&mut h, 2);
        assert_eq!(h.log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_future_events_wait() {
        let mut h = Harness::new();
        h.record(1, 5);
        step(&mut h, 4);
        assert!(h.log.is_empty());
        assert_eq!(h.dispatcher.next_event_in(), Some(1));
        step(&mut h, 5);
        assert_eq!(h.log, vec![1]);
    }

    #[test]
    fn test_zero_delay_runs_on_next_step() {
        let mut h = Harness::new();
        h.record(7, 0);
        assert!(h.log.is_empty());
        step(&mut h, 0);
        assert_eq!(h.log, vec![7]);
    }

    #[test]
    fn test_nested_execute_runs_in_same_step() {
        let mut h = Harness::new();
        h.dispatcher
            .execute(Box::new(|h: &mut Harness| {
                h.log.push(1);
                h.record(2, 0);
                h.record(3, 1);
                State::Ok
            }))
            .unwrap();
        step(&mut h, 0);
        assert_eq!(h.log, vec![1, 2]);
        step(&mut h, 1);
        assert_eq!(h.log, vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel() {
        let mut h = Harness::new();
        let id = h.record(1, 1);
        h.record(2, 1);
        assert!(h.dispatcher.cancel(id).is_ok());
        assert_eq!(h.dispatcher.cancel(id), Err(State::ElementNotFound));
        step(&mut h, 1);
        assert_eq!(h.log, vec![2]);
    }

    #[test]
    fn test_restart_pushes_event_back() {
        let mut h = Harness::new();
        let id = h.record(1, 2);
        step(&mut h, 1);
        h.dispatcher.restart(id, 2).unwrap();
        step(&mut h, 2);
        assert!(h.log.is_empty());
        step(&mut h, 3);
        assert_eq!(h.log, vec![1]);
        assert_eq!(h.dispatcher.restart(id, 1), Err(State::ElementNotFound));
    }

    #[test]
    fn test_step_counter_wrap_fires_once() {
        let mut h = Harness::new();
        step(&mut h, i64::MAX - 1);
        h.record(1, 1);
        h.record(2, 3);
        step(&mut h, i64::MAX);
        assert_eq!(h.log, vec![1]);
        step(&mut h, i64::MAX.wrapping_add(3));
        assert_eq!(h.log, vec![1, 2]);
        step(&mut h, i64::MAX.wrapping_add(10));
        assert_eq!(h.log, vec![1, 2]);
    }

    #[test]
    fn test_event_limit() {
        let mut h = Harness {
            dispatcher: EventDispatcher::new(2),
            log: Vec::new(),
        };
        h.record(1, 1);
        h.record(2, 1);
        let result = h
            .dispatcher
            .execute(Box::new(|_: &mut Harness| State::Ok));
        assert_eq!(result.unwrap_err(), State::NoMoreResourceAvailable);
    }

    #[test]
    fn test_fatal_state_stops() {
        let mut h = Harness::new();
        h.dispatcher
            .execute(Box::new(|_: &mut Harness| State::InternalError))
            .unwrap();
        h.record(2, 0);
        assert_eq!(step(&mut h, 0), State::InternalError);
        assert!(h.dispatcher.is_stopped());
        assert!(h.log.is_empty());
    }

    #[test]
    fn test_socket_continuation_is_single_shot() {
        let mut h = Harness::new();
        h.dispatcher.register_socket_fd(3).unwrap();
        h.dispatcher
            .continue_when_evt_on_socket(
                3,
                Interest::READABLE,
                Box::new(|h: &mut Harness| {
                    h.log.push(3);
                    State::Ok
                }),
            )
            .unwrap();
        assert_eq!(h.dispatcher.socket_interest(3), Some(Interest::READABLE));
        assert_eq!(update_event_on_socket(&mut h, 3), State::Ok);
        assert_eq!(update_event_on_socket(&mut h, 3), State::Ok);
        assert_eq!(h.log, vec![3]);
        assert_eq!(h.dispatcher.socket_interest(3), None);
    }

    #[test]
    fn test_unknown_fd() {
        let mut h = Harness::new();
        assert_eq!(update_event_on_socket(&mut h, 9), State::FdHandlerNotFound);
        assert_eq!(h.dispatcher.unregister_socket_fd(9), Err(State::FdHandlerNotFound));
        h.dispatcher.register_socket_fd(9).unwrap();
        assert_eq!(h.dispatcher.register_socket_fd(9), Err(State::InvalidParameter));
        h.dispatcher.unregister_socket_fd(9).unwrap();
        assert_eq!(h.dispatcher.registered_fds(), 0);
    }
}
