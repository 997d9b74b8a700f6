//! The event loop this stack runs on, as a consumed interface.
//!
//! The runtime never blocks; it schedules timers, idle callbacks and
//! file-descriptor watches against whatever reactor the platform
//! provides (sol-style mainloop, mio, a bare-metal superloop) and
//! suspends only inside the reactor's own wait.
//!
//! Scheduling is single-threaded cooperative: callbacks run
//! sequentially on the reactor thread and MUST NOT block. The one
//! escape hatch is [`Reactor::post_event`], which may be called from
//! another thread or an interrupt context and wakes the reactor.

use crate::time::Millis;

/// Raw file descriptor, as handed to [`Reactor::watch_fd`]
pub type Fd = i32;

/// What a periodic callback wants to happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
  /// Keep the timer / watch alive
  Continue,
  /// Disarm it; the callback will not fire again
  Stop,
}

/// Which I/O directions a watch cares about / fired for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdEvents {
  /// The fd is (or should be watched for becoming) readable
  pub readable: bool,
  /// The fd is (or should be watched for becoming) writable
  pub writable: bool,
}

impl FdEvents {
  /// Watch readability only
  pub const READ: FdEvents = FdEvents { readable: true,
                                        writable: false };
  /// Watch writability only
  pub const WRITE: FdEvents = FdEvents { readable: false,
                                         writable: true };
}

/// A cancellable registration handed out by a [`Reactor`].
///
/// `cancel` is idempotent and never invokes the callback it cancels.
pub trait Handle {
  /// Cancel the registration. Safe to call more than once.
  fn cancel(&self);
}

/// An abstract event loop.
///
/// The stack consumes this; it never implements it. See the
/// `test` module for the deterministic reactor the test suite runs on.
pub trait Reactor {
  /// Handle for [`Reactor::schedule_after`] registrations
  type Timer: Handle;
  /// Handle for [`Reactor::schedule_idle`] registrations
  type Idle: Handle;
  /// Handle for [`Reactor::watch_fd`] registrations
  type Watch: Handle;

  /// Run `f` once `after` has elapsed. Returning [`Poll::Continue`]
  /// re-arms the timer for another `after`.
  fn schedule_after(&self, after: Millis, f: Box<dyn FnMut() -> Poll>) -> Self::Timer;

  /// Run `f` once, the next time the reactor has nothing better to do.
  fn schedule_idle(&self, f: Box<dyn FnOnce()>) -> Self::Idle;

  /// Invoke `f` whenever `fd` reports any of `events`. Returning
  /// [`Poll::Stop`] removes the watch.
  fn watch_fd(&self, fd: Fd, events: FdEvents, f: Box<dyn FnMut(FdEvents) -> Poll>) -> Self::Watch;

  /// Enqueue `f` to run on the reactor thread and wake the reactor.
  ///
  /// This is the only entry point that is safe to call from another
  /// thread or from interrupt context; everything `f` touches then
  /// runs on the reactor thread as usual.
  fn post_event(&self, f: Box<dyn FnOnce() + Send>);
}

#[cfg(test)]
mod tests {
  use ::std::cell::RefCell;
  use ::std::collections::VecDeque;
  use ::std::rc::Rc;
  use ::std::sync::atomic::{AtomicBool, Ordering};
  use ::std::sync::Arc;

  use embedded_time::duration::Milliseconds;

  use super::*;

  type Shared<T> = Rc<RefCell<T>>;

  struct TimerEntry {
    due_at: u64,
    period: u64,
    f: Box<dyn FnMut() -> Poll>,
    alive: Arc<AtomicBool>,
  }

  /// The deterministic reactor the test suite runs on: time only
  /// moves when the test says so.
  #[derive(Default)]
  struct TestReactor {
    now: RefCell<u64>,
    timers: Shared<Vec<TimerEntry>>,
    idle: Shared<VecDeque<(Box<dyn FnOnce()>, Arc<AtomicBool>)>>,
    posted: Shared<VecDeque<Box<dyn FnOnce() + Send>>>,
  }

  struct TestHandle(Arc<AtomicBool>);

  impl Handle for TestHandle {
    fn cancel(&self) {
      self.0.store(false, Ordering::SeqCst);
    }
  }

  impl TestReactor {
    /// Advance the clock, firing whatever came due
    fn advance(&self, by: u64) {
      *self.now.borrow_mut() += by;
      let now = *self.now.borrow();

      let mut timers = self.timers.borrow_mut();
      timers.retain_mut(|t| {
              if !t.alive.load(Ordering::SeqCst) {
                return false;
              }
              if now < t.due_at {
                return true;
              }
              match (t.f)() {
                | Poll::Continue => {
                  t.due_at = now + t.period;
                  true
                },
                | Poll::Stop => false,
              }
            });
    }

    /// One pass over idle & posted work
    fn run_pending(&self) {
      while let Some((f, alive)) = self.idle.borrow_mut().pop_front() {
        if alive.load(Ordering::SeqCst) {
          f();
        }
      }
      while let Some(f) = self.posted.borrow_mut().pop_front() {
        f();
      }
    }
  }

  impl Reactor for TestReactor {
    type Timer = TestHandle;
    type Idle = TestHandle;
    type Watch = TestHandle;

    fn schedule_after(&self, after: Millis, f: Box<dyn FnMut() -> Poll>) -> TestHandle {
      let alive = Arc::new(AtomicBool::new(true));
      let Milliseconds(period) = after;
      self.timers.borrow_mut().push(TimerEntry { due_at: *self.now.borrow() + period,
                                                 period,
                                                 f,
                                                 alive: alive.clone() });
      TestHandle(alive)
    }

    fn schedule_idle(&self, f: Box<dyn FnOnce()>) -> TestHandle {
      let alive = Arc::new(AtomicBool::new(true));
      self.idle.borrow_mut().push_back((f, alive.clone()));
      TestHandle(alive)
    }

    fn watch_fd(&self, _: Fd, _: FdEvents, _: Box<dyn FnMut(FdEvents) -> Poll>) -> TestHandle {
      TestHandle(Arc::new(AtomicBool::new(true)))
    }

    fn post_event(&self, f: Box<dyn FnOnce() + Send>) {
      self.posted.borrow_mut().push_back(f);
    }
  }

  #[test]
  fn timer_fires_and_repeats_until_stop() {
    let reactor = TestReactor::default();
    let fired: Shared<u32> = Default::default();

    let fired_in_cb = fired.clone();
    reactor.schedule_after(Milliseconds(10),
                           Box::new(move || {
                             *fired_in_cb.borrow_mut() += 1;
                             if *fired_in_cb.borrow() < 3 {
                               Poll::Continue
                             } else {
                               Poll::Stop
                             }
                           }));

    reactor.advance(9);
    assert_eq!(*fired.borrow(), 0);

    for _ in 0..5 {
      reactor.advance(10);
    }
    assert_eq!(*fired.borrow(), 3);
  }

  #[test]
  fn cancel_is_idempotent_and_suppresses_the_callback() {
    let reactor = TestReactor::default();
    let fired: Shared<u32> = Default::default();

    let fired_in_cb = fired.clone();
    let handle = reactor.schedule_after(Milliseconds(10),
                                        Box::new(move || {
                                          *fired_in_cb.borrow_mut() += 1;
                                          Poll::Continue
                                        }));

    handle.cancel();
    handle.cancel();

    reactor.advance(100);
    assert_eq!(*fired.borrow(), 0);
  }

  #[test]
  fn idle_runs_once_and_post_event_crosses_threads() {
    let reactor = TestReactor::default();
    let order: Arc<::std::sync::Mutex<Vec<&'static str>>> = Default::default();

    let order_in_idle = order.clone();
    reactor.schedule_idle(Box::new(move || order_in_idle.lock().unwrap().push("idle")));

    // posted work may originate on another thread
    let order_in_posted = order.clone();
    reactor.post_event(Box::new(move || order_in_posted.lock().unwrap().push("posted")));

    reactor.run_pending();
    reactor.run_pending();

    assert_eq!(*order.lock().unwrap(), vec!["idle", "posted"]);
  }
}
