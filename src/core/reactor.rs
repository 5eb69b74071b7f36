//! Per-core reactors and the machinery that ties them together.
//!
//! A reactor instance to CPU core is a one-to-one relation. Each reactor owns
//! a lockless MP-SC ring through which any core sends it events (simple
//! function pointers plus argument pointers), and a list of lightweight
//! threads it polls every iteration. Thread objects may hold messages for a
//! specific subsystem; polling a thread executes its queued work within that
//! thread's context.
//!
//! A reactor normally busy-polls. It can also be switched, at runtime and per
//! core, into interrupt mode: the loop then sleeps on an fd-group consisting
//! of the event ring's wake fd, the reschedule wake fd, and the fd-groups of
//! all owned threads. The transition is coordinated with every peer core
//! through the notify cpusets so that no event enqueued during the switch is
//! lost.
//!
//! One reactor is designated the scheduling reactor. It periodically gathers
//! load metrics from all cores, lets the active scheduling policy decide on a
//! new thread placement, and applies the outcome (see [`crate::core::scheduler`]).

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    os::raw::c_void,
    os::unix::io::{AsRawFd, OwnedFd},
    ptr::NonNull,
    slice::Iter,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam::atomic::AtomicCell;
use nix::errno::Errno;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::core::{
    cpu_cores::{AtomicCpuMask, Cores, LCORE_ANY},
    env,
    event::{event_pool_init, Event, EventFn, EventPtr, EventRing, EVENT_BATCH_SIZE},
    fd_group::{eventfd, eventfd_write, FdGroup, FdType},
    scheduler,
    thread::{thread_lib_init, Thread, ThreadOp},
    ticks::{ticks, ticks_hz},
    CoreError,
};

/// Global state of the reactor subsystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReactorState {
    Uninitialized,
    Initialized,
    Running,
    Exiting,
    Shutdown,
}

impl Display for ReactorState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ReactorState::Uninitialized => "Uninitialized",
            ReactorState::Initialized => "Initialized",
            ReactorState::Running => "Running",
            ReactorState::Exiting => "Exiting",
            ReactorState::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

static GLOBAL_STATE: Lazy<AtomicCell<ReactorState>> =
    Lazy::new(|| AtomicCell::new(ReactorState::Uninitialized));

static INTERRUPT_MODE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether the whole application was configured to run interrupt driven from
/// the start. Individual reactors may still be flipped at runtime regardless.
pub fn interrupt_mode_is_enabled() -> bool {
    INTERRUPT_MODE_ENABLED.load(Ordering::SeqCst)
}

pub(crate) fn enable_interrupt_mode() {
    INTERRUPT_MODE_ENABLED.store(true, Ordering::SeqCst);
}

static CONTEXT_SWITCH_MONITOR: AtomicBool = AtomicBool::new(true);

pub fn enable_context_switch_monitor(enable: bool) {
    CONTEXT_SWITCH_MONITOR.store(enable, Ordering::SeqCst);
}

pub fn context_switch_monitor_enabled() -> bool {
    CONTEXT_SWITCH_MONITOR.load(Ordering::SeqCst)
}

/// 1s, expressed in microseconds.
const CONTEXT_SWITCH_MONITOR_PERIOD: u64 = 1_000_000;

fn rusage_period_tsc() -> u64 {
    CONTEXT_SWITCH_MONITOR_PERIOD * (ticks_hz() / 1_000_000)
}

#[derive(Debug)]
pub struct Reactors(Vec<Reactor>);

unsafe impl Sync for Reactors {}
unsafe impl Send for Reactors {}

unsafe impl Sync for Reactor {}
unsafe impl Send for Reactor {}

pub static REACTOR_LIST: OnceCell<Reactors> = OnceCell::new();

static REMOTE_HANDLES: Lazy<Mutex<Vec<JoinHandle<()>>>> = Lazy::new(|| Mutex::new(Vec::new()));

static STOPPING_REACTORS: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Round-robin cursor used when placing threads without a specific target.
static NEXT_CORE: Lazy<Mutex<usize>> = Lazy::new(|| Mutex::new(0));

impl Reactors {
    /// Initialize the reactor subsystem for each core assigned to us. The
    /// calling core becomes the initial scheduling reactor.
    pub fn init() {
        event_pool_init();
        thread_lib_init(Self::thread_op, Self::thread_op_supported);

        REACTOR_LIST.get_or_init(|| {
            Reactors(
                Cores::list()
                    .iter()
                    .map(|c| {
                        debug!("init core: {}", c);
                        Reactor::new(*c)
                    })
                    .collect::<Vec<_>>(),
            )
        });

        scheduler::subsystem_init();
        GLOBAL_STATE.store(ReactorState::Initialized);
    }

    /// advertise what thread scheduling operations we support
    fn thread_op_supported(op: ThreadOp) -> bool {
        matches!(op, ThreadOp::New | ThreadOp::Resched)
    }

    /// do the advertised scheduling operation
    fn thread_op(thread: Thread, op: ThreadOp) -> Result<(), CoreError> {
        match op {
            ThreadOp::New => Self::schedule_thread(thread),
            ThreadOp::Resched => {
                Self::request_thread_reschedule(&thread);
                Ok(())
            }
        }
    }

    /// get a reference to the reactor associated with the given core
    pub fn get_by_core(core: u32) -> Option<&'static Reactor> {
        match REACTOR_LIST.get() {
            Some(reactors) => reactors.into_iter().find(|r| r.lcore == core),
            None => {
                warn!("called get_by_core() before the reactors were initialized");
                None
            }
        }
    }

    /// get a reference to the reactor on the current core
    pub fn current() -> &'static Reactor {
        Self::get_by_core(Cores::current()).expect("no reactor allocated for this core")
    }

    /// returns an iterator over all reactors
    pub fn iter() -> Iter<'static, Reactor> {
        REACTOR_LIST.get().unwrap().into_iter()
    }

    pub fn state() -> ReactorState {
        GLOBAL_STATE.load()
    }

    pub(crate) fn set_state(state: ReactorState) {
        // reinitialize the shutdown latch in case the framework is
        // restarting within the same process
        if state == ReactorState::Running {
            *STOPPING_REACTORS.lock() = false;
        }
        GLOBAL_STATE.store(state);
    }

    /// Start polling on the given remote core. The reactor keeps running
    /// until the global state leaves [`ReactorState::Running`].
    pub fn launch_remote(core: u32) -> Result<(), CoreError> {
        if core == Cores::current() {
            return Ok(());
        }
        if !Cores::is_valid(core) {
            return Err(CoreError::InvalidCore { core });
        }

        let handle = std::thread::Builder::new()
            .name(format!("reactor_{}", core))
            .spawn(move || {
                Cores::enter(core);
                Cores::pin_current(core);
                Reactors::get_by_core(core)
                    .expect("launched core must have a reactor")
                    .run();
            })
            .map_err(|e| CoreError::ReactorLaunch {
                core,
                source: Errno::from_i32(e.raw_os_error().unwrap_or(libc::EAGAIN)),
            })?;

        REMOTE_HANDLES.lock().push(handle);
        Ok(())
    }

    /// Block until every remote reactor OS thread has finished.
    pub fn wait_all() {
        let handles = std::mem::take(&mut *REMOTE_HANDLES.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("a reactor thread panicked during shutdown");
            }
        }
    }

    /// Run `func` on every valid reactor in lcore order, then `cpl` on the
    /// originating core. The traversal is chained through the regular event
    /// path, so each step executes on the reactor it describes.
    pub fn for_each_reactor(func: EventFn, arg1: *mut c_void, arg2: *mut c_void, cpl: EventFn) {
        Self::for_each_reactor_inner(func, arg1, arg2, cpl, false);
    }

    fn for_each_reactor_inner(
        func: EventFn,
        arg1: *mut c_void,
        arg2: *mut c_void,
        cpl: EventFn,
        stopping: bool,
    ) {
        // Once the shutdown traversal has been posted no further traversal
        // may start; late callers go straight to their completion callback so
        // nothing leaks during teardown.
        {
            let mut latch = STOPPING_REACTORS.lock();
            if *latch {
                drop(latch);
                cpl(arg1, arg2);
                return;
            }
            if stopping {
                *latch = true;
            }
        }

        let orig_core = match Cores::current() {
            LCORE_ANY => Cores::first(),
            core => core,
        };

        let cr = Box::into_raw(Box::new(CallReactor {
            cur: 0,
            func,
            arg1,
            arg2,
            orig_core,
            cpl,
        }));

        debug!("Starting reactor iteration from {}", orig_core);
        match Event::allocate(Cores::first(), on_reactor, cr as *mut c_void, std::ptr::null_mut())
        {
            Some(ev) => Event::call(ev),
            None => {
                error!("Unable to perform reactor iteration");
                end_reactor(cr as *mut c_void, std::ptr::null_mut());
            }
        }
    }

    /// Initiate shutdown: fan a final traversal across all reactors whose
    /// completion flips the global state and wakes every sleeping reactor.
    pub fn stop() {
        Self::for_each_reactor_inner(
            nop,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            _reactors_stop,
            true,
        );
    }

    /// Flip one reactor between polling and interrupt mode. Only legal on the
    /// scheduling reactor, one transition in flight per target; `cb` runs on
    /// the scheduling reactor when the transition committed. Requesting the
    /// already-committed mode acknowledges synchronously.
    pub fn set_interrupt_mode<F>(
        lcore: u32,
        new_in_interrupt: bool,
        cb: F,
    ) -> Result<(), CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        let target =
            Self::get_by_core(lcore).ok_or(CoreError::ReactorNotFound { core: lcore })?;

        // eventfd support is required to ever sleep
        if target.interrupt.is_none() {
            return Err(CoreError::InterruptsNotSupported { core: lcore });
        }

        if Cores::current() != scheduler::scheduling_lcore() {
            error!("Setting interrupt mode is only permitted within the scheduling reactor");
            return Err(CoreError::NotSchedulingReactor {});
        }

        if target.in_interrupt() == new_in_interrupt {
            cb();
            return Ok(());
        }

        if target.set_interrupt_mode_in_progress.load(Ordering::SeqCst) {
            info!(
                "Reactor({}) is already in progress to set interrupt mode",
                lcore
            );
            return Err(CoreError::InterruptModeInProgress { core: lcore });
        }
        target
            .set_interrupt_mode_in_progress
            .store(true, Ordering::SeqCst);

        target
            .new_in_interrupt
            .store(new_in_interrupt, Ordering::SeqCst);
        *target.set_interrupt_mode_cb.lock() = Some(Box::new(cb));

        debug!(
            "Starting reactor interrupt state event from {} to {}",
            Cores::current(),
            lcore
        );

        let arg = target as *const Reactor as *mut c_void;
        if !new_in_interrupt {
            // When setting the reactor to poll mode, first change the mode of
            // the reactor and only then clear the corresponding bit in every
            // peer's notify cpuset.
            match Event::allocate(lcore, _reactor_set_interrupt_mode, arg, std::ptr::null_mut())
            {
                Some(ev) => Event::call(ev),
                None => {
                    error!("Unable to start the interrupt mode transition");
                    target
                        .set_interrupt_mode_in_progress
                        .store(false, Ordering::SeqCst);
                    target.set_interrupt_mode_cb.lock().take();
                    return Err(CoreError::EventPoolExhausted {});
                }
            }
        } else {
            // When setting the reactor to interrupt mode, first set the
            // corresponding bit in every peer's notify cpuset and only then
            // change the mode.
            Self::for_each_reactor(
                _reactor_set_notify_cpuset,
                arg,
                std::ptr::null_mut(),
                _reactor_set_notify_cpuset_cpl,
            );
        }

        Ok(())
    }

    /// Pick a core for a thread and hand it over through a scheduling event.
    pub(crate) fn schedule_thread(thread: Thread) -> Result<(), CoreError> {
        let lw = thread.lw();
        let mut core = lw.lcore();
        lw.reset_for_schedule();

        let current_lcore = Cores::current();
        let local_reactor = if current_lcore == LCORE_ANY {
            None
        } else {
            Self::get_by_core(current_lcore)
        };

        let mut cpumask = thread.cpumask();

        // When thread interrupt ability is not enabled application wide and
        // we run on a reactor, avoid placing threads onto sleeping reactors
        // that this reactor could only wake with a syscall.
        if !interrupt_mode_is_enabled() {
            if let Some(local) = local_reactor {
                let mut polling_mask = Cores::mask();
                polling_mask.xor(&local.notify_cpuset());

                if core == LCORE_ANY {
                    let mut valid_mask = polling_mask;
                    valid_mask.and(&thread.cpumask());
                    cpumask = if valid_mask.count() != 0 {
                        valid_mask
                    } else {
                        polling_mask
                    };
                } else if !polling_mask.get_cpu(core) {
                    core = LCORE_ANY;
                    cpumask = polling_mask;
                }
            }
        }

        let arg = Box::into_raw(Box::new(thread.clone()));
        let ev = {
            let mut next_core = NEXT_CORE.lock();
            if core == LCORE_ANY {
                for _ in 0 .. Cores::count() {
                    if *next_core >= Cores::list().len() {
                        *next_core = 0;
                    }
                    core = Cores::list()[*next_core];
                    *next_core += 1;
                    if cpumask.get_cpu(core) {
                        break;
                    }
                }
            }

            if current_lcore != core {
                trace!(
                    target: "scheduler",
                    thread = thread.id(),
                    src = current_lcore,
                    dst = core,
                    "moving thread"
                );
            }

            Event::allocate(core, _schedule_thread, arg as *mut c_void, std::ptr::null_mut())
        };

        match ev {
            Some(ev) => {
                lw.set_tsc_start(ticks());
                Event::call(ev);
                Ok(())
            }
            None => {
                unsafe { drop(Box::from_raw(arg)) };
                error!("Unable to schedule thread on requested core mask");
                Err(CoreError::ThreadSchedule {
                    name: thread.name().to_owned(),
                })
            }
        }
    }

    /// A running thread asked to be moved; the owning reactor completes the
    /// move during post-processing of its next iteration.
    fn request_thread_reschedule(thread: &Thread) {
        debug_assert_eq!(
            Thread::current().map(|t| t.id()),
            Some(thread.id()),
            "reschedule requests must come from the thread itself"
        );

        let lw = thread.lw();
        lw.set_resched(true);
        lw.set_lcore(LCORE_ANY);

        let reactor = Reactors::current();
        // a sleeping reactor needs a kick to notice the request
        if reactor.notify_cpuset().get_cpu(reactor.lcore) {
            reactor.notify_resched();
        }
    }
}

impl<'a> IntoIterator for &'a Reactors {
    type Item = &'a Reactor;
    type IntoIter = ::std::slice::Iter<'a, Reactor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Interrupt facilities of one reactor: its fd-group plus the two eventfds
/// peers use to wake it.
struct ReactorInterrupt {
    fgrp: Arc<FdGroup>,
    events_fd: OwnedFd,
    resched_fd: OwnedFd,
}

impl ReactorInterrupt {
    fn init(lcore: u32) -> Result<Self, CoreError> {
        let fgrp = FdGroup::create(&format!("reactor_{}", lcore))?;

        let resched_fd = eventfd()?;
        fgrp.add_fd(
            resched_fd.as_raw_fd(),
            "resched",
            FdType::Eventfd,
            move || match Reactors::get_by_core(lcore) {
                Some(reactor) => reactor.schedule_thread_event() as i32,
                None => 0,
            },
        )?;

        let events_fd = eventfd()?;
        fgrp.add_fd(
            events_fd.as_raw_fd(),
            "events",
            FdType::Eventfd,
            move || match Reactors::get_by_core(lcore) {
                Some(reactor) => reactor.event_queue_run_batch() as i32,
                None => 0,
            },
        )?;

        Ok(Self {
            fgrp,
            events_fd,
            resched_fd,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ReactorStats {
    pub busy_tsc: u64,
    pub idle_tsc: u64,
}

pub struct Reactor {
    /// the logical core this reactor is created on
    lcore: u32,
    /// threads owned by this reactor, polled every iteration
    threads: RefCell<VecDeque<Thread>>,
    /// incoming cross-core events
    events: EventRing,
    tsc_last: Cell<u64>,
    busy_tsc: Cell<u64>,
    idle_tsc: Cell<u64>,
    /// which peers must be woken through their events fd when we produce for
    /// them
    notify_cpuset: AtomicCpuMask,
    /// committed and requested interrupt state
    in_interrupt: AtomicBool,
    new_in_interrupt: AtomicBool,
    set_interrupt_mode_in_progress: AtomicBool,
    set_interrupt_mode_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    interrupt: Option<ReactorInterrupt>,
    last_rusage: Cell<u64>,
    rusage: Cell<(i64, i64)>,
}

impl Reactor {
    fn new(lcore: u32) -> Self {
        let interrupt = match ReactorInterrupt::init(lcore) {
            Ok(intr) => Some(intr),
            Err(e) => {
                // interrupt facilities are mandatory only when the whole app
                // was asked to run interrupt driven
                if interrupt_mode_is_enabled() {
                    panic!("Failed to prepare interrupt facilities: {}", e);
                }
                warn!("reactor {}: no interrupt facilities: {}", lcore, e);
                None
            }
        };

        let reactor = Self {
            lcore,
            threads: RefCell::new(VecDeque::new()),
            events: EventRing::new(),
            tsc_last: Cell::new(0),
            busy_tsc: Cell::new(0),
            idle_tsc: Cell::new(0),
            notify_cpuset: AtomicCpuMask::new(),
            in_interrupt: AtomicBool::new(false),
            new_in_interrupt: AtomicBool::new(false),
            set_interrupt_mode_in_progress: AtomicBool::new(false),
            set_interrupt_mode_cb: Mutex::new(None),
            interrupt,
            last_rusage: Cell::new(0),
            rusage: Cell::new((0, 0)),
        };

        // with full interrupt ability every reactor starts out sleeping and
        // every peer must always notify
        if interrupt_mode_is_enabled() {
            for core in Cores::list() {
                reactor.notify_cpuset.set_cpu(*core, true);
            }
            reactor.in_interrupt.store(true, Ordering::SeqCst);
        }

        reactor
    }

    pub fn lcore(&self) -> u32 {
        self.lcore
    }

    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.load(Ordering::SeqCst)
    }

    pub fn notify_cpuset(&self) -> crate::core::cpu_cores::CpuMask {
        self.notify_cpuset.snapshot()
    }

    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            busy_tsc: self.busy_tsc.get(),
            idle_tsc: self.idle_tsc.get(),
        }
    }

    pub(crate) fn busy_tsc(&self) -> u64 {
        self.busy_tsc.get()
    }

    pub(crate) fn idle_tsc(&self) -> u64 {
        self.idle_tsc.get()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.borrow().len()
    }

    pub fn thread_ids(&self) -> Vec<u64> {
        self.threads.borrow().iter().map(|t| t.id()).collect()
    }

    pub(crate) fn lw_threads(&self) -> Vec<Thread> {
        self.threads.borrow().iter().cloned().collect()
    }

    pub fn is_scheduling_reactor(&self) -> bool {
        self.lcore == scheduler::scheduling_lcore()
    }

    pub(crate) fn enqueue_event(&self, ev: EventPtr) {
        self.events.enqueue(ev);
    }

    /// wake the reactor through its event queue fd
    pub(crate) fn notify_event_queue(&self) {
        if let Some(intr) = &self.interrupt {
            eventfd_write(intr.events_fd.as_raw_fd(), "event queue");
        }
    }

    /// wake the reactor through its reschedule fd
    pub(crate) fn notify_resched(&self) {
        if let Some(intr) = &self.interrupt {
            eventfd_write(intr.resched_fd.as_raw_fd(), "reschedule");
        }
    }

    /// Drain up to one batch of events and execute them outside any thread
    /// context. While interrupt driven, a non-empty ring after the batch
    /// re-arms the event fd so the next wait fires again immediately.
    pub(crate) fn event_queue_run_batch(&self) -> usize {
        let mut batch = [EventPtr(NonNull::dangling()); EVENT_BATCH_SIZE];

        let count = self.events.dequeue(&mut batch);

        if self.in_interrupt() && self.events.count() != 0 {
            self.notify_event_queue();
        }

        if count == 0 {
            return 0;
        }

        for ev in batch.iter().take(count) {
            debug_assert!(
                Thread::current().is_none(),
                "events execute outside of any thread context"
            );
            Event::execute(*ev);
        }

        Event::free_bulk(&batch[.. count]);
        count
    }

    /// One polling iteration: events first (they may spawn work on local
    /// threads), then every owned thread, with busy/idle accounting.
    pub fn poll_once(&self) {
        self.event_queue_run_batch();

        // with no threads present tsc_last would go stale
        if self.threads.borrow().is_empty() {
            let now = ticks();
            self.idle_tsc
                .set(self.idle_tsc.get() + now.saturating_sub(self.tsc_last.get()));
            self.tsc_last.set(now);
            return;
        }

        let mut i = 0;
        loop {
            let thread = match self.threads.borrow().get(i) {
                Some(thread) => thread.clone(),
                None => break,
            };

            let rc = thread.poll(0, self.tsc_last.get());

            let now = thread.last_tsc();
            let elapsed = now.saturating_sub(self.tsc_last.get());
            if rc == 0 {
                self.idle_tsc.set(self.idle_tsc.get() + elapsed);
            } else {
                self.busy_tsc.set(self.busy_tsc.get() + elapsed);
            }
            self.tsc_last.set(now);

            if !self.post_process_lw_thread(&thread) {
                i += 1;
            }
        }
    }

    /// Sleep until any event, reschedule request or thread message arrives.
    fn interrupt_run(&self) {
        if let Some(intr) = &self.interrupt {
            if let Err(e) = intr.fgrp.wait(-1) {
                error!("reactor {}: fd group wait failed: {}", self.lcore, e);
            }
        }
    }

    fn remove_lw_thread(&self, thread: &Thread) {
        let mut threads = self.threads.borrow_mut();
        if let Some(pos) = threads.iter().position(|t| t == thread) {
            threads.remove(pos);
        }
        drop(threads);

        if self.in_interrupt() {
            if let Some(intr) = &self.interrupt {
                intr.fgrp.unnest(&thread.interrupt_fd_group()).ok();
            }
        }
    }

    /// Returns true when the thread left this reactor: destroyed once exited
    /// and idle, or handed back to placement when rescheduled. Bound threads
    /// never migrate.
    fn post_process_lw_thread(&self, thread: &Thread) -> bool {
        if thread.is_exited() && thread.is_idle() {
            self.remove_lw_thread(thread);
            thread.destroy();
            return true;
        }

        if thread.lw().resched() && !thread.is_bound() {
            thread.lw().set_resched(false);
            self.remove_lw_thread(thread);
            if let Err(e) = Reactors::schedule_thread(thread.clone()) {
                error!("failed to reschedule thread '{}': {}", thread.name(), e);
            }
            return true;
        }

        false
    }

    /// Reschedule-fd handler: post-process all owned threads so pending
    /// reschedules move out while the reactor sleeps.
    pub(crate) fn schedule_thread_event(&self) -> usize {
        debug_assert!(self.in_interrupt());
        self.lw_threads()
            .iter()
            .filter(|thread| self.post_process_lw_thread(thread))
            .count()
    }

    fn sample_rusage(&self) {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) } != 0 {
            return;
        }

        let (prev_nvcsw, prev_nivcsw) = self.rusage.get();
        if usage.ru_nvcsw != prev_nvcsw || usage.ru_nivcsw != prev_nivcsw {
            info!(
                "Reactor {}: {} voluntary context switches and {} involuntary \
                 context switches in the last second",
                self.lcore,
                usage.ru_nvcsw - prev_nvcsw,
                usage.ru_nivcsw - prev_nivcsw
            );
        }
        self.rusage.set((usage.ru_nvcsw, usage.ru_nivcsw));
    }

    fn complete_interrupt_mode_cb(&self) {
        if let Some(cb) = self.set_interrupt_mode_cb.lock().take() {
            // completion always runs on the scheduling reactor, chained as an
            // event so it orders with everything else targeted there
            if let Err(cb) = Event::spawn_on(scheduler::scheduling_lcore(), cb) {
                error!("Unable to dispatch interrupt mode completion, running inline");
                cb();
            }
        }
    }

    /// The reactor loop. Runs until the global state leaves `Running`, then
    /// drains and destroys every owned thread.
    pub fn run(&self) {
        info!("Reactor started on core {}", self.lcore);

        self.tsc_last.set(ticks());
        self.last_rusage.set(ticks());
        let mut last_sched: u64 = 0;

        loop {
            if self.in_interrupt() {
                self.interrupt_run();
            } else {
                self.poll_once();
            }

            if context_switch_monitor_enabled()
                && self.last_rusage.get() + rusage_period_tsc() < self.tsc_last.get()
            {
                self.sample_rusage();
                self.last_rusage.set(self.tsc_last.get());
            }

            let period = scheduler::period_tsc();
            if period > 0
                && self.tsc_last.get().saturating_sub(last_sched) > period
                && self.is_scheduling_reactor()
                && !scheduler::in_progress()
            {
                last_sched = self.tsc_last.get();
                scheduler::start_pass();
            }

            if self.lcore == Cores::first()
                && env::SIG_RECEIVED.swap(false, Ordering::SeqCst)
            {
                warn!("stopping reactors on signal");
                env::environment_stop(0);
            }

            if Reactors::state() != ReactorState::Running {
                break;
            }
        }

        debug!("initiating shutdown for core {}", self.lcore);

        // every thread should have exited by now, except for the app thread
        // which the framework winds down itself
        for thread in self.lw_threads() {
            if thread.is_running() {
                if !thread.is_app_thread() {
                    error!(
                        "thread '{}' was still running at reactor shutdown",
                        thread.name()
                    );
                }
                thread.exit();
            }
        }

        loop {
            let threads = self.lw_threads();
            if threads.is_empty() {
                break;
            }
            for thread in threads {
                if thread.is_exited() {
                    self.remove_lw_thread(&thread);
                    thread.destroy();
                } else if self.in_interrupt() {
                    self.interrupt_run();
                } else {
                    thread.poll(0, 0);
                }
            }
        }

        info!("reactor {} stopped", self.lcore);
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("lcore", &self.lcore)
            .field("threads", &self.thread_count())
            .field("in_interrupt", &self.in_interrupt())
            .finish()
    }
}

/// Target-side half of a scheduling event: adopt the thread into the local
/// reactor's list and align its delivery mode.
fn _schedule_thread(arg1: *mut c_void, _arg2: *mut c_void) {
    let thread = *unsafe { Box::from_raw(arg1 as *mut Thread) };
    let reactor = Reactors::current();

    // update total stats to reflect the state of the thread at the end of
    // the move
    let lw = thread.lw();
    lw.set_total_stats(thread.stats());

    if lw.initial_lcore() == LCORE_ANY {
        lw.set_initial_lcore(reactor.lcore);
    }
    lw.set_lcore(reactor.lcore);

    reactor.threads.borrow_mut().push_back(thread.clone());

    let in_interrupt = reactor.in_interrupt();
    if in_interrupt {
        if let Some(intr) = &reactor.interrupt {
            if let Err(e) = intr.fgrp.nest(thread.interrupt_fd_group()) {
                error!("Failed to nest scheduled thread: {}", e);
            }
        }
    }

    // align the thread's delivery mode with its new reactor; messages that
    // raced the adoption re-surface through the nested fd group
    thread.set_interrupt_mode(in_interrupt);
}

/// Ran on each reactor during a transition fan-out: record whether the
/// target must be notified from here on.
fn _reactor_set_notify_cpuset(arg1: *mut c_void, _arg2: *mut c_void) {
    let target = unsafe { &*(arg1 as *const Reactor) };
    let reactor = Reactors::current();
    reactor
        .notify_cpuset
        .set_cpu(target.lcore, target.new_in_interrupt.load(Ordering::SeqCst));
}

fn _reactor_set_notify_cpuset_cpl(arg1: *mut c_void, _arg2: *mut c_void) {
    let target = unsafe { &*(arg1 as *const Reactor) };

    if !target.new_in_interrupt.load(Ordering::SeqCst) {
        // transition to poll mode is complete once the peers stopped
        // notifying
        target
            .set_interrupt_mode_in_progress
            .store(false, Ordering::SeqCst);
        target.complete_interrupt_mode_cb();
    } else {
        // peers now notify; let the target itself commit the flip
        match Event::allocate(
            target.lcore,
            _reactor_set_interrupt_mode,
            arg1,
            std::ptr::null_mut(),
        ) {
            Some(ev) => Event::call(ev),
            None => {
                error!("Unable to dispatch interrupt mode flip, aborting transition");
                target
                    .set_interrupt_mode_in_progress
                    .store(false, Ordering::SeqCst);
                target.complete_interrupt_mode_cb();
            }
        }
    }
}

/// Commit the interrupt state flip on the target core itself.
fn _reactor_set_interrupt_mode(arg1: *mut c_void, _arg2: *mut c_void) {
    let target = unsafe { &*(arg1 as *const Reactor) };

    debug_assert_eq!(target.lcore, Cores::current());
    let new_mode = target.new_in_interrupt.load(Ordering::SeqCst);
    debug_assert_ne!(target.in_interrupt(), new_mode);

    debug!(
        "Do reactor set on core {} from {} to state {}",
        target.lcore,
        if target.in_interrupt() { "intr" } else { "poll" },
        if new_mode { "intr" } else { "poll" }
    );

    target.in_interrupt.store(new_mode, Ordering::SeqCst);

    // align every owned thread with the reactor
    for thread in target.lw_threads() {
        if let Some(intr) = &target.interrupt {
            if new_mode {
                if let Err(e) = intr.fgrp.nest(thread.interrupt_fd_group()) {
                    error!("Failed to nest thread '{}': {}", thread.name(), e);
                }
            } else {
                intr.fgrp.unnest(&thread.interrupt_fd_group()).ok();
            }
        }
        thread.set_interrupt_mode(new_mode);
    }

    if !new_mode {
        // Reactor is no longer in interrupt mode. Refresh tsc_last to
        // accurately track reactor stats, then tell the peers to stop
        // notifying.
        target.tsc_last.set(ticks());
        Reactors::for_each_reactor(
            _reactor_set_notify_cpuset,
            arg1,
            std::ptr::null_mut(),
            _reactor_set_notify_cpuset_cpl,
        );
    } else {
        // always trigger both wake fds to cover enqueues racing with the
        // flip
        target.notify_event_queue();
        target.notify_resched();

        target
            .set_interrupt_mode_in_progress
            .store(false, Ordering::SeqCst);
        target.complete_interrupt_mode_cb();
    }
}

struct CallReactor {
    cur: usize,
    func: EventFn,
    arg1: *mut c_void,
    arg2: *mut c_void,
    orig_core: u32,
    cpl: EventFn,
}

fn on_reactor(arg1: *mut c_void, _arg2: *mut c_void) {
    let cr = unsafe { &mut *(arg1 as *mut CallReactor) };

    (cr.func)(cr.arg1, cr.arg2);

    cr.cur += 1;

    let ev = if cr.cur >= Cores::list().len() {
        debug!("Completed reactor iteration");
        Event::allocate(cr.orig_core, end_reactor, arg1, std::ptr::null_mut())
    } else {
        let next = Cores::list()[cr.cur];
        debug!("Continuing reactor iteration to {}", next);
        Event::allocate(next, on_reactor, arg1, std::ptr::null_mut())
    };

    match ev {
        Some(ev) => Event::call(ev),
        None => {
            error!("Unable to continue reactor iteration");
            end_reactor(arg1, std::ptr::null_mut());
        }
    }
}

fn end_reactor(arg1: *mut c_void, _arg2: *mut c_void) {
    let cr = unsafe { Box::from_raw(arg1 as *mut CallReactor) };
    (cr.cpl)(cr.arg1, cr.arg2);
}

fn nop(_arg1: *mut c_void, _arg2: *mut c_void) {}

/// Completion of the shutdown traversal: leave `Running` and wake every
/// reactor that needs an explicit kick, honoring the usual notification
/// rules.
fn _reactors_stop(_arg1: *mut c_void, _arg2: *mut c_void) {
    Reactors::set_state(ReactorState::Exiting);

    let current_core = Cores::current();
    let local_reactor = if current_core == LCORE_ANY {
        None
    } else {
        Reactors::get_by_core(current_core)
    };

    for reactor in Reactors::iter() {
        let must_notify = match local_reactor {
            Some(local) => local.notify_cpuset().get_cpu(reactor.lcore),
            None => true,
        };
        if must_notify {
            reactor.notify_event_queue();
        }
    }
}
