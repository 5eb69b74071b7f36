//!
//! The lightweight thread runtime. A [`Thread`] is not an OS thread: consider
//! it a container to which work is submitted as messages and which is polled
//! by the reactor that currently owns it to drive the submitted work to
//! completion.
//!
//! Threads carry a cpumask restricting which reactors may own them, FIFO
//! message queues fed from any core, busy/idle tick accounting, and an
//! interrupt fd-group which surfaces "messages pending" as a waitable
//! descriptor whenever the owning reactor sleeps instead of polling.
//!
//! The runtime itself does not place threads. Placement is delegated through
//! the thread-op hook installed at startup; the reactor layer registers ops
//! that schedule new threads onto cores and migrate rescheduled ones.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    os::unix::io::{AsRawFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam::queue::SegQueue;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::{
    cpu_cores::{CpuMask, LCORE_ANY},
    fd_group::{eventfd, eventfd_write, FdGroup, FdType},
    ticks::ticks,
    CoreError,
};

/// Default number of messages ran per poll quantum.
pub const THREAD_MSG_BATCH_SIZE: usize = 8;

/// Operations the runtime asks the scheduling layer to perform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThreadOp {
    /// a new thread needs a core
    New,
    /// a running thread asked to be moved
    Resched,
}

type ThreadOpFn = fn(Thread, ThreadOp) -> Result<(), CoreError>;
type ThreadOpSupportedFn = fn(ThreadOp) -> bool;

static THREAD_OPS: Lazy<Mutex<Option<(ThreadOpFn, ThreadOpSupportedFn)>>> =
    Lazy::new(|| Mutex::new(None));

static THREADS: Lazy<Mutex<HashMap<u64, Thread>>> = Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// The very first thread created is the application thread; the framework
/// tears it down itself during shutdown.
const APP_THREAD_ID: u64 = 1;

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Thread>> = RefCell::new(None);
}

/// Install the scheduling hooks consulted on thread creation and reschedule.
pub fn thread_lib_init(op: ThreadOpFn, op_supported: ThreadOpSupportedFn) {
    *THREAD_OPS.lock() = Some((op, op_supported));
}

pub fn thread_lib_fini() {
    *THREAD_OPS.lock() = None;
}

fn dispatch_op(thread: Thread, op: ThreadOp) -> Result<(), CoreError> {
    let (op_fn, supported) = match *THREAD_OPS.lock() {
        Some(ops) => ops,
        None => return Err(CoreError::ThreadOpsNotInstalled {}),
    };
    if !supported(op) {
        return Err(CoreError::ThreadOpsNotInstalled {});
    }
    op_fn(thread, op)
}

/// Busy/idle tick counters of one thread.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ThreadStats {
    pub busy_tsc: u64,
    pub idle_tsc: u64,
}

/// Reactor-side context of a thread: where it runs, where it first ran, and
/// the per-scheduling-period stat snapshots. Owned by the reactor layer, the
/// runtime only stores it alongside the thread.
#[derive(Debug)]
pub struct LwThread {
    lcore: AtomicU32,
    initial_lcore: AtomicU32,
    resched: AtomicBool,
    tsc_start: AtomicU64,
    current_busy: AtomicU64,
    current_idle: AtomicU64,
    total_busy: AtomicU64,
    total_idle: AtomicU64,
}

impl LwThread {
    fn new() -> Self {
        Self {
            lcore: AtomicU32::new(LCORE_ANY),
            initial_lcore: AtomicU32::new(LCORE_ANY),
            resched: AtomicBool::new(false),
            tsc_start: AtomicU64::new(0),
            current_busy: AtomicU64::new(0),
            current_idle: AtomicU64::new(0),
            total_busy: AtomicU64::new(0),
            total_idle: AtomicU64::new(0),
        }
    }

    pub fn lcore(&self) -> u32 {
        self.lcore.load(Ordering::SeqCst)
    }

    pub(crate) fn set_lcore(&self, lcore: u32) {
        self.lcore.store(lcore, Ordering::SeqCst);
    }

    pub fn initial_lcore(&self) -> u32 {
        self.initial_lcore.load(Ordering::SeqCst)
    }

    pub(crate) fn set_initial_lcore(&self, lcore: u32) {
        self.initial_lcore.store(lcore, Ordering::SeqCst);
    }

    pub fn resched(&self) -> bool {
        self.resched.load(Ordering::SeqCst)
    }

    pub(crate) fn set_resched(&self, resched: bool) {
        self.resched.store(resched, Ordering::SeqCst);
    }

    pub(crate) fn set_tsc_start(&self, tsc: u64) {
        self.tsc_start.store(tsc, Ordering::SeqCst);
    }

    pub fn current_stats(&self) -> ThreadStats {
        ThreadStats {
            busy_tsc: self.current_busy.load(Ordering::SeqCst),
            idle_tsc: self.current_idle.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn set_current_stats(&self, stats: ThreadStats) {
        self.current_busy.store(stats.busy_tsc, Ordering::SeqCst);
        self.current_idle.store(stats.idle_tsc, Ordering::SeqCst);
    }

    pub fn total_stats(&self) -> ThreadStats {
        ThreadStats {
            busy_tsc: self.total_busy.load(Ordering::SeqCst),
            idle_tsc: self.total_idle.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn set_total_stats(&self, stats: ThreadStats) {
        self.total_busy.store(stats.busy_tsc, Ordering::SeqCst);
        self.total_idle.store(stats.idle_tsc, Ordering::SeqCst);
    }

    /// Wipe the placement state ahead of a (re)schedule. The initial lcore is
    /// the one piece that survives moves.
    pub(crate) fn reset_for_schedule(&self) {
        let initial = self.initial_lcore();
        self.set_lcore(LCORE_ANY);
        self.set_resched(false);
        self.set_tsc_start(0);
        self.set_current_stats(ThreadStats::default());
        self.set_total_stats(ThreadStats::default());
        self.set_initial_lcore(initial);
    }
}

struct ThreadInner {
    id: u64,
    name: String,
    cpumask: CpuMask,
    bound: bool,
    msgs: SegQueue<Box<dyn FnOnce() + Send>>,
    exiting: AtomicBool,
    exited: AtomicBool,
    interrupt_mode: AtomicBool,
    msg_fd: OwnedFd,
    fgrp: Arc<FdGroup>,
    busy_tsc: AtomicU64,
    idle_tsc: AtomicU64,
    last_tsc: AtomicU64,
    lw: LwThread,
}

/// Handle to a lightweight thread. Cheap to clone; the thread is destroyed
/// explicitly once it has exited, not when handles drop.
#[derive(Clone)]
pub struct Thread(Arc<ThreadInner>);

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Thread {
    /// Create a thread restricted to the given set of cores and hand it to
    /// the scheduling layer for placement.
    pub fn new(name: &str, cpumask: CpuMask) -> Result<Self, CoreError> {
        Self::create(name, cpumask, false)
    }

    /// Create a thread pinned to one core; bound threads never migrate.
    pub fn new_bound(name: &str, core: u32) -> Result<Self, CoreError> {
        Self::create(name, CpuMask::single(core), true)
    }

    fn create(name: &str, cpumask: CpuMask, bound: bool) -> Result<Self, CoreError> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
        let msg_fd = eventfd()?;
        let fgrp = FdGroup::create(name)?;

        // readiness of msg_fd means "messages pending": drain them by running
        // a poll quantum in the owning reactor's wait loop; anything beyond
        // the batch re-arms the fd so the next wait fires again
        fgrp.add_fd(msg_fd.as_raw_fd(), "thread_msgs", FdType::Eventfd, move || {
            match Thread::get_by_id(id) {
                Some(thread) => {
                    let count = thread.poll(0, 0);
                    if !thread.is_idle() {
                        thread.notify_msgs();
                    }
                    count as i32
                }
                None => 0,
            }
        })?;

        let thread = Thread(Arc::new(ThreadInner {
            id,
            name: name.to_owned(),
            cpumask,
            bound,
            msgs: SegQueue::new(),
            exiting: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            interrupt_mode: AtomicBool::new(false),
            msg_fd,
            fgrp,
            busy_tsc: AtomicU64::new(0),
            idle_tsc: AtomicU64::new(0),
            last_tsc: AtomicU64::new(ticks()),
            lw: LwThread::new(),
        }));

        THREADS.lock().insert(id, thread.clone());

        if let Err(e) = dispatch_op(thread.clone(), ThreadOp::New) {
            THREADS.lock().remove(&id);
            return Err(e);
        }

        debug!("created thread '{}' id {}", name, id);
        Ok(thread)
    }

    pub fn get_by_id(id: u64) -> Option<Thread> {
        THREADS.lock().get(&id).cloned()
    }

    /// The thread currently entered on this OS thread, if any. Event handlers
    /// always observe `None`.
    pub fn current() -> Option<Thread> {
        CURRENT_THREAD.with(|c| c.borrow().clone())
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn cpumask(&self) -> CpuMask {
        self.0.cpumask
    }

    pub fn is_bound(&self) -> bool {
        self.0.bound
    }

    pub fn is_app_thread(&self) -> bool {
        self.0.id == APP_THREAD_ID
    }

    /// reactor-side placement context
    pub fn lw(&self) -> &LwThread {
        &self.0.lw
    }

    pub fn interrupt_fd_group(&self) -> Arc<FdGroup> {
        self.0.fgrp.clone()
    }

    /// surface "messages pending" on the interrupt fd group
    fn notify_msgs(&self) {
        eventfd_write(self.0.msg_fd.as_raw_fd(), "thread message queue");
    }

    /// Submit a message. Messages from one sender are delivered in order;
    /// delivery wakes the owning reactor when the thread is in interrupt mode.
    pub fn send_msg<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_exited() {
            return Err(CoreError::ThreadExited { id: self.0.id });
        }
        self.0.msgs.push(Box::new(f));
        if self.0.interrupt_mode.load(Ordering::SeqCst) {
            self.notify_msgs();
        }
        Ok(())
    }

    /// Run one poll quantum: up to `max_msgs` pending messages (0 selects the
    /// default batch), with busy/idle ticks accounted against `last_tsc` (0
    /// selects the thread's own last poll time). Returns the amount of work
    /// done.
    pub fn poll(&self, max_msgs: usize, last_tsc: u64) -> usize {
        let limit = if max_msgs == 0 {
            THREAD_MSG_BATCH_SIZE
        } else {
            max_msgs
        };
        let prev = if last_tsc != 0 {
            last_tsc
        } else {
            self.0.last_tsc.load(Ordering::SeqCst)
        };

        let restore = CURRENT_THREAD.with(|c| c.replace(Some(self.clone())));

        let mut count = 0;
        while count < limit {
            match self.0.msgs.pop() {
                Some(msg) => {
                    msg();
                    count += 1;
                }
                None => break,
            }
        }

        CURRENT_THREAD.with(|c| *c.borrow_mut() = restore);

        if self.0.exiting.load(Ordering::SeqCst)
            && self.0.msgs.is_empty()
            && !self.0.exited.swap(true, Ordering::SeqCst)
        {
            debug!("thread '{}' id {} exited", self.0.name, self.0.id);
        }

        let now = ticks();
        if count > 0 {
            self.0
                .busy_tsc
                .fetch_add(now.saturating_sub(prev), Ordering::SeqCst);
        } else {
            self.0
                .idle_tsc
                .fetch_add(now.saturating_sub(prev), Ordering::SeqCst);
        }
        self.0.last_tsc.store(now, Ordering::SeqCst);

        count
    }

    /// Ask to be moved to another reactor. Must be called from the thread
    /// itself; the owning reactor completes the move on its next iteration.
    pub fn reschedule(&self) -> Result<(), CoreError> {
        dispatch_op(self.clone(), ThreadOp::Resched)
    }

    /// Mark the thread as exiting; it reports exited once its message queue
    /// has drained.
    pub fn exit(&self) {
        self.0.exiting.store(true, Ordering::SeqCst);
        // wake a sleeping owner so the final drain actually runs
        if self.0.interrupt_mode.load(Ordering::SeqCst) {
            self.notify_msgs();
        }
    }

    pub fn is_exited(&self) -> bool {
        self.0.exited.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.0.exiting.load(Ordering::SeqCst) && !self.is_exited()
    }

    pub fn is_idle(&self) -> bool {
        self.0.msgs.is_empty()
    }

    /// Align the thread's delivery mode with its owning reactor. While in
    /// interrupt mode every message send kicks `msg_fd`.
    pub fn set_interrupt_mode(&self, enable: bool) {
        self.0.interrupt_mode.store(enable, Ordering::SeqCst);
        if enable && !self.0.msgs.is_empty() {
            // messages enqueued just before the flip must still wake us
            self.notify_msgs();
        }
    }

    pub fn stats(&self) -> ThreadStats {
        ThreadStats {
            busy_tsc: self.0.busy_tsc.load(Ordering::SeqCst),
            idle_tsc: self.0.idle_tsc.load(Ordering::SeqCst),
        }
    }

    pub fn last_tsc(&self) -> u64 {
        self.0.last_tsc.load(Ordering::SeqCst)
    }

    /// Drop the exited thread from the registry.
    pub fn destroy(&self) {
        debug_assert!(self.is_exited());
        debug!("destroying thread '{}' id {}", self.0.name, self.0.id);
        THREADS.lock().remove(&self.0.id);
    }
}

impl Debug for Thread {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("cpumask", &self.0.cpumask)
            .field("lcore", &self.0.lw.lcore())
            .finish()
    }
}

impl Display for Thread {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.0.name, self.0.id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn permissive_ops() {
        thread_lib_init(|_, _| Ok(()), |_| true);
    }

    #[test]
    fn message_fifo_and_accounting() {
        permissive_ops();
        let thread = Thread::new("ut_fifo", CpuMask::single(0)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0 .. 3 {
            let order = order.clone();
            thread.send_msg(move || order.lock().push(i)).unwrap();
        }

        assert!(!thread.is_idle());
        assert_eq!(thread.poll(0, 0), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(thread.is_idle());
        assert!(thread.stats().busy_tsc > 0);

        // an idle quantum accrues idle ticks only
        let busy = thread.stats().busy_tsc;
        assert_eq!(thread.poll(0, 0), 0);
        assert_eq!(thread.stats().busy_tsc, busy);

        thread.exit();
        thread.poll(0, 0);
        assert!(thread.is_exited());
        thread.destroy();
    }

    #[test]
    fn poll_limits_batch() {
        permissive_ops();
        let thread = Thread::new("ut_batch", CpuMask::single(0)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0 .. THREAD_MSG_BATCH_SIZE + 2 {
            let hits = hits.clone();
            thread
                .send_msg(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert_eq!(thread.poll(0, 0), THREAD_MSG_BATCH_SIZE);
        assert_eq!(thread.poll(0, 0), 2);

        thread.exit();
        thread.poll(0, 0);
        thread.destroy();
    }

    #[test]
    fn interrupt_mode_surfaces_messages() {
        permissive_ops();
        let thread = Thread::new("ut_intr", CpuMask::single(0)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        thread.set_interrupt_mode(true);
        let counted = hits.clone();
        thread
            .send_msg(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // the message is delivered through the interrupt fd group
        let grp = thread.interrupt_fd_group();
        assert!(grp.wait(100).unwrap() >= 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        thread.exit();
        thread.poll(0, 0);
        assert!(thread.is_exited());
        assert!(thread.send_msg(|| {}).is_err());
        thread.destroy();
    }

    #[test]
    fn current_thread_tracking() {
        permissive_ops();
        let thread = Thread::new("ut_tls", CpuMask::single(0)).unwrap();
        let id = thread.id();

        let seen = Arc::new(Mutex::new(None));
        let keep = seen.clone();
        thread
            .send_msg(move || {
                *keep.lock() = Thread::current().map(|t| t.id());
            })
            .unwrap();

        assert!(Thread::current().is_none());
        thread.poll(0, 0);
        assert_eq!(*seen.lock(), Some(id));
        assert!(Thread::current().is_none());

        thread.exit();
        thread.poll(0, 0);
        thread.destroy();
    }
}
