//!
//! Cross-core messages. An event is a one-shot callable addressed to a target
//! lcore; it travels through the target reactor's multi-producer single
//! consumer ring and is executed by the owning reactor outside of any
//! lightweight thread context.
//!
//! Events are preallocated from a global pool so the send path never
//! allocates. The pool is deliberately smaller than the per-reactor rings:
//! allocation fails before any ring can fill up, which is why the enqueue
//! itself is allowed to treat "ring full" as a programming error.

use std::{os::raw::c_void, ptr::NonNull};

use crossbeam::queue::ArrayQueue;
use once_cell::sync::OnceCell;

use crate::core::{
    cpu_cores::{Cores, LCORE_ANY},
    mempool::MemPool,
    reactor::Reactors,
};

/// Handler executed on the target core with the two opaque arguments the
/// producer packed into the event.
pub type EventFn = fn(*mut c_void, *mut c_void);

/// Number of events drained from the ring per reactor iteration.
pub const EVENT_BATCH_SIZE: usize = 8;

/// Per-reactor event ring capacity.
pub(crate) const EVENT_RING_SIZE: usize = 65_536;

/// Power of 2 minus 1 is optimal for memory consumption.
const EVENT_POOL_SIZE: u64 = (1 << 14) - 1;

#[derive(Debug)]
pub struct Event {
    lcore: u32,
    func: EventFn,
    arg1: *mut c_void,
    arg2: *mut c_void,
}

/// Pool pointer to an event. Ownership moves from the producer into the ring
/// and from the ring to the dispatching reactor.
#[derive(Clone, Copy)]
pub(crate) struct EventPtr(pub(crate) NonNull<Event>);

unsafe impl Send for EventPtr {}

static EVENT_POOL: OnceCell<MemPool<Event>> = OnceCell::new();

/// Set up the global event pool. Called once before any reactor starts.
pub(crate) fn event_pool_init() {
    EVENT_POOL.get_or_init(|| {
        MemPool::<Event>::create(
            &format!("evtpool_{}", std::process::id()),
            EVENT_POOL_SIZE,
        )
        .expect("failed to create the event pool")
    });
}

fn event_pool() -> &'static MemPool<Event> {
    EVENT_POOL.get().expect("event pool not initialized")
}

impl Event {
    /// Allocate an event for the given target lcore. Returns `None` when the
    /// event pool is exhausted; the caller decides whether that is fatal.
    pub fn allocate(
        lcore: u32,
        func: EventFn,
        arg1: *mut c_void,
        arg2: *mut c_void,
    ) -> Option<EventRef> {
        if Reactors::get_by_core(lcore).is_none() {
            error!("event allocated for invalid core {}", lcore);
            return None;
        }

        event_pool()
            .get(Event {
                lcore,
                func,
                arg1,
                arg2,
            })
            .map(|ptr| EventRef(EventPtr(ptr)))
    }

    /// Enqueue the event on its target reactor and wake the reactor when the
    /// notification rules require it: a producer that is not a reactor always
    /// notifies, a reactor-resident producer notifies only peers marked in
    /// its own notify cpuset.
    pub fn call(ev: EventRef) {
        let ev = ev.0;
        let lcore = unsafe { ev.0.as_ref().lcore };
        let reactor = Reactors::get_by_core(lcore).expect("target reactor must exist");

        reactor.enqueue_event(ev);

        let current_core = Cores::current();
        let local_reactor = if current_core == LCORE_ANY {
            None
        } else {
            Reactors::get_by_core(current_core)
        };

        match local_reactor {
            Some(local) if !local.notify_cpuset().get_cpu(lcore) => {}
            _ => reactor.notify_event_queue(),
        }
    }

    /// Run a closure on the given core, packing it through the regular event
    /// path. On pool exhaustion the closure is handed back to the caller.
    pub fn spawn_on<F>(lcore: u32, f: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let arg = Box::into_raw(Box::new(f));
        match Event::allocate(
            lcore,
            closure_trampoline::<F>,
            arg as *mut c_void,
            std::ptr::null_mut(),
        ) {
            Some(ev) => {
                Event::call(ev);
                Ok(())
            }
            None => Err(*unsafe { Box::from_raw(arg) }),
        }
    }

    pub(crate) fn execute(ev: EventPtr) {
        let (func, arg1, arg2) = {
            let ev = unsafe { ev.0.as_ref() };
            (ev.func, ev.arg1, ev.arg2)
        };
        func(arg1, arg2);
    }

    pub(crate) fn free_bulk(evs: &[EventPtr]) {
        for ev in evs {
            event_pool().put(ev.0);
        }
    }
}

fn closure_trampoline<F: FnOnce()>(arg1: *mut c_void, _arg2: *mut c_void) {
    let f = unsafe { Box::from_raw(arg1 as *mut F) };
    f();
}

/// An allocated event on its way to [`Event::call`].
pub struct EventRef(EventPtr);

/// Bounded MP-SC queue of events owned by one reactor. Any core enqueues,
/// only the owning reactor dequeues.
pub(crate) struct EventRing {
    ring: ArrayQueue<EventPtr>,
}

impl EventRing {
    pub(crate) fn new() -> Self {
        Self {
            ring: ArrayQueue::new(EVENT_RING_SIZE),
        }
    }

    /// Enqueue never fails by design: the event pool is sized well below the
    /// ring capacity, so a full ring means the process is misconfigured.
    pub(crate) fn enqueue(&self, ev: EventPtr) {
        assert!(
            self.ring.push(ev).is_ok(),
            "event ring overflow: event pool larger than the ring"
        );
    }

    /// Dequeue up to `out.len()` events, returning how many were written.
    pub(crate) fn dequeue(&self, out: &mut [EventPtr]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.ring.pop() {
                Some(ev) => {
                    *slot = ev;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub(crate) fn count(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_arg1: *mut c_void, _arg2: *mut c_void) {}

    #[test]
    fn ring_preserves_fifo_order() {
        let ring = EventRing::new();

        let mut ptrs = Vec::new();
        for lcore in 0 .. 3 {
            let ev = Box::leak(Box::new(Event {
                lcore,
                func: noop,
                arg1: std::ptr::null_mut(),
                arg2: std::ptr::null_mut(),
            }));
            let ptr = EventPtr(NonNull::from(ev));
            ptrs.push(ptr);
            ring.enqueue(ptr);
        }
        assert_eq!(ring.count(), 3);

        let mut out = [EventPtr(NonNull::dangling()); EVENT_BATCH_SIZE];
        let count = ring.dequeue(&mut out);
        assert_eq!(count, 3);
        assert_eq!(ring.count(), 0);
        for (i, ev) in out.iter().take(count).enumerate() {
            assert_eq!(unsafe { ev.0.as_ref().lcore }, i as u32);
        }

        for ptr in ptrs {
            unsafe { drop(Box::from_raw(ptr.0.as_ptr())) };
        }
    }
}
