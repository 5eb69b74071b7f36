//! Pluggable thread scheduling policies and the periodic pass that drives
//! them.
//!
//! Every scheduling period the designated scheduling reactor walks all cores
//! through a chained event traversal (phase 1) so each core fills in its own
//! load metrics, hands the gathered picture to the active policy (phase 2)
//! and applies the outcome (phase 3): core interrupt-mode changes first, one
//! at a time, then thread moves by flagging the affected threads for
//! reschedule. Isolated cores are exempt from migration in both directions.
//!
//! Policies only ever mutate the `lcore` field of the thread rows and the
//! per-core `interrupt_mode` flag; everything else is input.

use std::{
    os::raw::c_void,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::core::{
    cpu_cores::{Cores, CpuMask, LCORE_ANY},
    event::{Event, EventFn},
    reactor::{ReactorState, Reactors},
    thread::{Thread, ThreadStats},
    ticks::ticks_hz,
    CoreError,
};

/// Load metrics of one thread, plus the policy's placement decision: on
/// input `lcore` is the owner, on output it is the requested target.
#[derive(Debug, Default, Clone)]
pub struct ThreadInfo {
    pub lcore: u32,
    pub thread_id: u64,
    pub current_stats: ThreadStats,
    pub total_stats: ThreadStats,
}

/// Per-core metrics handed to the policy. `interrupt_mode` may be flipped by
/// the policy to request a mode change for that core.
#[derive(Debug, Default)]
pub struct CoreInfo {
    pub lcore: u32,
    pub current_busy_tsc: u64,
    pub current_idle_tsc: u64,
    pub total_busy_tsc: u64,
    pub total_idle_tsc: u64,
    pub interrupt_mode: bool,
    pub isolated: bool,
    pub thread_infos: Vec<ThreadInfo>,
}

/// A placement policy. Registered once, selected by name.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn deinit(&self) {}

    /// Decide on a new placement. Rows of invalid lcores are left at their
    /// defaults and must be ignored.
    fn balance(&self, cores: &mut [CoreInfo]);
}

static SCHEDULER_LIST: Lazy<Mutex<Vec<&'static dyn Scheduler>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

static CURRENT_SCHEDULER: Lazy<Mutex<Option<&'static dyn Scheduler>>> =
    Lazy::new(|| Mutex::new(None));

static SCHEDULING_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

static PERIOD_US: AtomicU64 = AtomicU64::new(0);
static PERIOD_TSC: AtomicU64 = AtomicU64::new(0);

static SCHEDULING_LCORE: AtomicU32 = AtomicU32::new(LCORE_ANY);

/// Cursor of the one-at-a-time interrupt mode application in phase 3.
static CORE_MODE_CURSOR: AtomicU32 = AtomicU32::new(LCORE_ANY);

static CORE_INFOS: OnceCell<Mutex<Vec<CoreInfo>>> = OnceCell::new();

static ISOLATED_CORE_MASK: Lazy<Mutex<CpuMask>> = Lazy::new(|| Mutex::new(CpuMask::new()));

fn core_infos() -> &'static Mutex<Vec<CoreInfo>> {
    CORE_INFOS.get().expect("scheduler subsystem not initialized")
}

/// Wire up the scheduler state for the active core set and register the
/// built-in policy. The calling core becomes the scheduling reactor.
pub(crate) fn subsystem_init() {
    CORE_INFOS.get_or_init(|| {
        let len = (Cores::last() + 1) as usize;
        let mut rows = Vec::with_capacity(len);
        rows.resize_with(len, CoreInfo::default);
        Mutex::new(rows)
    });

    let lcore = match Cores::current() {
        LCORE_ANY => Cores::first(),
        core => core,
    };
    SCHEDULING_LCORE.store(lcore, Ordering::SeqCst);

    register(Box::new(StaticScheduler));
}

/// Register a policy under its name. Names must be unique.
pub fn register(scheduler: Box<dyn Scheduler>) {
    let mut list = SCHEDULER_LIST.lock();
    if list.iter().any(|s| s.name() == scheduler.name()) {
        error!("scheduler named '{}' already registered", scheduler.name());
        return;
    }
    list.push(Box::leak(scheduler));
}

/// Select the active policy by name; `None` deselects scheduling altogether.
/// When the new policy fails to initialize the previous one is restored.
pub fn set(name: Option<&str>) -> Result<(), CoreError> {
    let mut current = CURRENT_SCHEDULER.lock();

    let name = match name {
        None => {
            if let Some(old) = current.take() {
                old.deinit();
            }
            return Ok(());
        }
        Some(name) => name,
    };

    let new = SCHEDULER_LIST
        .lock()
        .iter()
        .copied()
        .find(|s| s.name() == name)
        .ok_or(CoreError::SchedulerNotFound {
            name: name.to_owned(),
        })?;

    if let Some(old) = *current {
        if old.name() == new.name() {
            return Ok(());
        }
    }

    let old = current.take();
    if let Some(old) = old {
        old.deinit();
    }

    match new.init() {
        Ok(()) => {
            *current = Some(new);
            Ok(())
        }
        Err(e) => {
            match old {
                Some(old) => {
                    error!(
                        "Could not init '{}' scheduler, reverting to '{}'",
                        name,
                        old.name()
                    );
                    old.init().ok();
                    *current = Some(old);
                }
                None => error!("Could not init '{}' scheduler", name),
            }
            Err(e)
        }
    }
}

pub fn get() -> Option<&'static dyn Scheduler> {
    *CURRENT_SCHEDULER.lock()
}

/// Scheduling period; 0 disables the periodic pass.
pub fn set_period_us(us: u64) {
    PERIOD_US.store(us, Ordering::SeqCst);
    PERIOD_TSC.store(us * (ticks_hz() / 1_000_000), Ordering::SeqCst);
}

pub fn period_us() -> u64 {
    PERIOD_US.load(Ordering::SeqCst)
}

pub(crate) fn period_tsc() -> u64 {
    PERIOD_TSC.load(Ordering::SeqCst)
}

pub fn scheduling_lcore() -> u32 {
    SCHEDULING_LCORE.load(Ordering::SeqCst)
}

/// Move the scheduling duty to another core. Only legal between passes.
pub fn set_scheduling_lcore(core: u32) -> bool {
    if Reactors::get_by_core(core).is_none() {
        error!(
            "Failed to set scheduling reactor. Reactor(lcore:{}) does not exist",
            core
        );
        return false;
    }
    if in_progress() {
        error!("Cannot move the scheduling reactor while a pass is in progress");
        return false;
    }
    SCHEDULING_LCORE.store(core, Ordering::SeqCst);
    true
}

/// Restrict migration: threads on isolated cores stay, none move in. The
/// mask must be a subset of the application core mask.
pub fn set_isolated_core_mask(mask: CpuMask) -> bool {
    let app_mask = Cores::mask();
    let mut merged = app_mask;
    merged.or(&mask);
    if merged != app_mask {
        error!("Isolated core mask is not included in app core mask");
        return false;
    }
    *ISOLATED_CORE_MASK.lock() = mask;
    true
}

pub fn isolated_core_mask() -> CpuMask {
    *ISOLATED_CORE_MASK.lock()
}

fn is_isolated_core(core: u32) -> bool {
    ISOLATED_CORE_MASK.lock().get_cpu(core)
}

pub fn in_progress() -> bool {
    SCHEDULING_IN_PROGRESS.load(Ordering::SeqCst)
}

/// Kick off a pass on the scheduling reactor. Phase 1 starts right here
/// since the scheduling reactor is a core like any other.
pub(crate) fn start_pass() {
    SCHEDULING_IN_PROGRESS.store(true, Ordering::SeqCst);
    trace!(target: "scheduler", "scheduling period start");
    _gather_metrics(std::ptr::null_mut(), std::ptr::null_mut());
}

fn dispatch_phase(lcore: u32, phase: EventFn) {
    match Event::allocate(lcore, phase, std::ptr::null_mut(), std::ptr::null_mut()) {
        Some(ev) => Event::call(ev),
        None => {
            error!("Unable to dispatch scheduling phase, cancelling this round");
            _cancel(std::ptr::null_mut(), std::ptr::null_mut());
        }
    }
}

fn cancel_pass() {
    match Event::allocate(
        scheduling_lcore(),
        _cancel,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    ) {
        Some(ev) => Event::call(ev),
        None => _cancel(std::ptr::null_mut(), std::ptr::null_mut()),
    }
}

/// Phase 1, ran on every core in turn: snapshot the core's and its threads'
/// tick deltas since the previous period.
fn _gather_metrics(_arg1: *mut c_void, _arg2: *mut c_void) {
    let reactor = Reactors::current();
    let lcore = reactor.lcore();

    {
        let mut infos = core_infos().lock();
        let info = &mut infos[lcore as usize];
        info.lcore = lcore;
        info.current_idle_tsc = reactor.idle_tsc() - info.total_idle_tsc;
        info.total_idle_tsc = reactor.idle_tsc();
        info.current_busy_tsc = reactor.busy_tsc() - info.total_busy_tsc;
        info.total_busy_tsc = reactor.busy_tsc();
        info.interrupt_mode = reactor.in_interrupt();
        info.isolated = is_isolated_core(lcore);
        info.thread_infos.clear();

        trace!(
            target: "scheduler",
            core = lcore,
            busy = info.current_busy_tsc,
            idle = info.current_idle_tsc,
            "core stats"
        );

        let threads = reactor.lw_threads();
        if !threads.is_empty() {
            let mut rows = Vec::new();
            if rows.try_reserve_exact(threads.len()).is_err() {
                error!("Failed to allocate memory when gathering metrics on {}", lcore);
                drop(infos);
                cancel_pass();
                return;
            }

            for thread in &threads {
                let lw = thread.lw();

                // read the previous totals before refreshing them to get the
                // stats of the last scheduling period
                let prev_total = lw.total_stats();
                let total = thread.stats();
                lw.set_total_stats(total);
                lw.set_current_stats(ThreadStats {
                    busy_tsc: total.busy_tsc - prev_total.busy_tsc,
                    idle_tsc: total.idle_tsc - prev_total.idle_tsc,
                });

                let current = lw.current_stats();
                trace!(
                    target: "scheduler",
                    thread = thread.id(),
                    busy = current.busy_tsc,
                    idle = current.idle_tsc,
                    "thread stats"
                );

                rows.push(ThreadInfo {
                    lcore: lw.lcore(),
                    thread_id: thread.id(),
                    current_stats: current,
                    total_stats: total,
                });
            }
            info.thread_infos = rows;
        }
    }

    // continue with the next core; looping back to the scheduling reactor
    // moves the pass to the balancing phase
    let next = Cores::next(lcore).unwrap_or_else(Cores::first);
    if next == scheduling_lcore() {
        dispatch_phase(next, _balance);
    } else {
        dispatch_phase(next, _gather_metrics);
    }
}

/// Phase 2, on the scheduling reactor: let the policy mutate the placement.
fn _balance(_arg1: *mut c_void, _arg2: *mut c_void) {
    let scheduler = match get() {
        Some(scheduler) if Reactors::state() == ReactorState::Running => scheduler,
        _ => {
            _cancel(std::ptr::null_mut(), std::ptr::null_mut());
            return;
        }
    };

    {
        let mut infos = core_infos().lock();
        scheduler.balance(infos.as_mut_slice());
    }

    CORE_MODE_CURSOR.store(Cores::first(), Ordering::SeqCst);
    _update_core_mode(std::ptr::null_mut(), std::ptr::null_mut());
}

/// Phase 3a: apply requested interrupt-mode changes, strictly one transition
/// in flight; re-entered as each transition's completion callback.
fn _update_core_mode(_arg1: *mut c_void, _arg2: *mut c_void) {
    let mut core = CORE_MODE_CURSOR.load(Ordering::SeqCst);

    while core != LCORE_ANY {
        if let Some(reactor) = Reactors::get_by_core(core) {
            let wanted = core_infos().lock()[core as usize].interrupt_mode;
            if reactor.in_interrupt() != wanted {
                let rc = Reactors::set_interrupt_mode(core, wanted, || {
                    _update_core_mode(std::ptr::null_mut(), std::ptr::null_mut())
                });
                match rc {
                    Ok(()) => {
                        // come back for the remaining cores once this
                        // transition completed
                        CORE_MODE_CURSOR
                            .store(Cores::next(core).unwrap_or(LCORE_ANY), Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!("skipping interrupt mode change of core {}: {}", core, e)
                    }
                }
            }
        }
        core = Cores::next(core).unwrap_or(LCORE_ANY);
    }

    _finish();
}

/// Phase 3b: flag the requested thread moves and close the pass.
fn _finish() {
    {
        let mut infos = core_infos().lock();
        _threads_reschedule(infos.as_mut_slice());
    }
    SCHEDULING_IN_PROGRESS.store(false, Ordering::SeqCst);
}

fn _threads_reschedule(infos: &mut [CoreInfo]) {
    for &core in Cores::list() {
        let rows = std::mem::take(&mut infos[core as usize].thread_infos);
        for row in rows {
            if row.lcore == core {
                continue;
            }
            if row.lcore as usize >= infos.len() || !Cores::is_valid(row.lcore) {
                error!(
                    "Scheduling policy requested invalid core {}. Skip rescheduling thread",
                    row.lcore
                );
                continue;
            }
            if infos[core as usize].isolated || infos[row.lcore as usize].isolated {
                error!(
                    "A thread cannot be moved from an isolated core or moved to an \
                     isolated core. Skip rescheduling thread"
                );
                continue;
            }
            if let Some(thread) = Thread::get_by_id(row.thread_id) {
                let lw = thread.lw();
                lw.set_lcore(row.lcore);
                lw.set_resched(true);
                trace!(
                    target: "scheduler",
                    thread = row.thread_id,
                    src = core,
                    dst = row.lcore,
                    "moving thread"
                );
            }
        }
    }
}

/// Cancel the running pass: free the gathered rows, clear the latch. The
/// next period simply retries.
fn _cancel(_arg1: *mut c_void, _arg2: *mut c_void) {
    let mut infos = core_infos().lock();
    for info in infos.iter_mut() {
        info.thread_infos = Vec::new();
    }
    SCHEDULING_IN_PROGRESS.store(false, Ordering::SeqCst);
}

/// The built-in do-nothing policy: placement stays as it is and no core
/// changes mode.
struct StaticScheduler;

impl Scheduler for StaticScheduler {
    fn name(&self) -> &'static str {
        "static"
    }

    fn balance(&self, _cores: &mut [CoreInfo]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedScheduler(&'static str);

    impl Scheduler for NamedScheduler {
        fn name(&self) -> &'static str {
            self.0
        }

        fn balance(&self, _cores: &mut [CoreInfo]) {}
    }

    struct FailingScheduler;

    impl Scheduler for FailingScheduler {
        fn name(&self) -> &'static str {
            "ut_failing"
        }

        fn init(&self) -> Result<(), CoreError> {
            Err(CoreError::SchedulerNotFound {
                name: "ut_failing".into(),
            })
        }

        fn balance(&self, _cores: &mut [CoreInfo]) {}
    }

    #[test]
    fn select_by_name() {
        register(Box::new(NamedScheduler("ut_a")));
        register(Box::new(NamedScheduler("ut_b")));

        assert!(set(Some("ut_missing")).is_err());

        set(Some("ut_a")).unwrap();
        assert_eq!(get().unwrap().name(), "ut_a");

        // selecting the selected one is a no-op
        set(Some("ut_a")).unwrap();
        assert_eq!(get().unwrap().name(), "ut_a");

        set(Some("ut_b")).unwrap();
        assert_eq!(get().unwrap().name(), "ut_b");

        // a policy that fails to init leaves the old one active
        register(Box::new(FailingScheduler));
        assert!(set(Some("ut_failing")).is_err());
        assert_eq!(get().unwrap().name(), "ut_b");

        set(None).unwrap();
        assert!(get().is_none());
    }

    #[test]
    fn period_conversion() {
        set_period_us(0);
        assert_eq!(period_tsc(), 0);

        set_period_us(1_000);
        assert_eq!(period_us(), 1_000);
        // one millisecond worth of nanosecond ticks
        assert_eq!(period_tsc(), 1_000_000);
        set_period_us(0);
    }
}
