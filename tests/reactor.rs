//! End-to-end scenarios against a live four-core environment: cross-core
//! event dispatch, interrupt mode transitions, thread placement and the
//! scheduling pass.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
        Arc,
        Mutex,
    },
    time::Duration,
};

use assert_matches::assert_matches;
use once_cell::sync::OnceCell;

use reactor_engine::core::{
    scheduler::{self, CoreInfo, Scheduler},
    CoreError,
    Cores,
    CpuMask,
    Event,
    ReactorCliArgs,
    ReactorEnvironment,
    Reactors,
    Thread,
    LCORE_ANY,
};

pub mod common;
use common::{on_core, start_background, wait_until};

static ENV: OnceCell<()> = OnceCell::new();

/// Tests that reconfigure the scheduler or flip core modes must not overlap.
static SCHED_LOCK: Mutex<()> = Mutex::new(());

fn setup() {
    ENV.get_or_init(|| {
        let args = ReactorCliArgs {
            core_list: Some("0-3".into()),
            disable_core_locks: true,
            skip_sig_handler: true,
            ..Default::default()
        };
        start_background(ReactorEnvironment::new(args).init());
    });
}

#[test]
fn cross_core_event_dispatch() {
    setup();

    // neither polling reactor needs to notify the other
    assert!(!Reactors::get_by_core(0)
        .unwrap()
        .notify_cpuset()
        .get_cpu(1));

    // produce on reactor 0, consume on reactor 1
    let rx = on_core(0, || {
        let (tx, rx) = mpsc::channel();
        Event::spawn_on(1, move || {
            tx.send(Cores::current()).unwrap();
        })
        .map_err(|_| "event pool exhausted")
        .unwrap();
        rx
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
}

#[test]
fn interrupt_mode_transition_protocol() {
    setup();
    let _serial = SCHED_LOCK.lock().unwrap();
    let sched = scheduler::scheduling_lcore();
    assert_eq!(sched, 0);

    // transitions may only be initiated on the scheduling reactor
    let rc = on_core(1, || Reactors::set_interrupt_mode(2, true, || {}));
    assert_matches!(rc, Err(CoreError::NotSchedulingReactor {}));

    // unknown core
    let rc = on_core(sched, || Reactors::set_interrupt_mode(77, true, || {}));
    assert_matches!(rc, Err(CoreError::ReactorNotFound { core: 77 }));

    // flip core 2 into interrupt mode; the completion callback must run on
    // the scheduling reactor with the transition fully committed
    let (tx, rx) = mpsc::channel();
    on_core(sched, move || {
        Reactors::set_interrupt_mode(2, true, move || {
            tx.send(Cores::current()).unwrap();
        })
        .unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), sched);

    let target = Reactors::get_by_core(2).unwrap();
    assert!(target.in_interrupt());
    for reactor in Reactors::iter() {
        assert!(
            reactor.notify_cpuset().get_cpu(2),
            "peer {} must notify the sleeping reactor",
            reactor.lcore()
        );
    }

    // an event enqueued from a peer wakes the sleeping reactor
    let rx = on_core(0, || {
        let (tx, rx) = mpsc::channel();
        Event::spawn_on(2, move || {
            tx.send(Cores::current()).unwrap();
        })
        .map_err(|_| "event pool exhausted")
        .unwrap();
        rx
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);

    // fast path: requesting the committed mode acknowledges synchronously
    let acked = on_core(sched, || {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        Reactors::set_interrupt_mode(2, true, move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        seen.load(Ordering::SeqCst)
    });
    assert!(acked);

    // start the way back to polling and immediately request another flip:
    // the first transition cannot complete while this event handler runs on
    // the scheduling reactor, so the second request reports busy
    let (busy, rx) = on_core(sched, || {
        let (tx, rx) = mpsc::channel();
        Reactors::set_interrupt_mode(2, false, move || {
            tx.send(()).unwrap();
        })
        .unwrap();
        let busy = Reactors::set_interrupt_mode(2, true, || {});
        (busy, rx)
    });
    assert_matches!(busy, Err(CoreError::InterruptModeInProgress { core: 2 }));
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(!Reactors::get_by_core(2).unwrap().in_interrupt());
    for reactor in Reactors::iter() {
        assert!(!reactor.notify_cpuset().get_cpu(2));
    }
}

#[test]
fn thread_reschedule_cycle() {
    setup();

    let thread = Thread::new("ut_worker", CpuMask::from_core_list("0-2").unwrap()).unwrap();
    let id = thread.id();

    wait_until("thread placed", || {
        Reactors::iter().any(|r| r.thread_ids().contains(&id))
    });
    let first_home = thread.lw().lcore();
    assert_ne!(first_home, LCORE_ANY);
    assert_eq!(thread.lw().initial_lcore(), first_home);

    // the move request must come from the thread itself
    let requested = Arc::new(AtomicBool::new(false));
    let requester = thread.clone();
    let flag = requested.clone();
    thread
        .send_msg(move || {
            requester.reschedule().unwrap();
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    wait_until("reschedule requested", || requested.load(Ordering::SeqCst));
    wait_until("thread rescheduled", || {
        !thread.lw().resched() && thread.lw().lcore() != LCORE_ANY
    });

    // exactly one reactor owns the thread and the first home sticks
    let owners = Reactors::iter()
        .filter(|r| r.thread_ids().contains(&id))
        .count();
    assert_eq!(owners, 1);
    assert_eq!(thread.lw().initial_lcore(), first_home);

    thread.exit();
    wait_until("thread destroyed", || Thread::get_by_id(id).is_none());
}

/// Policy used by the isolation test: requests every thread to move to one
/// fixed core.
struct HerdScheduler;

impl Scheduler for HerdScheduler {
    fn name(&self) -> &'static str {
        "ut_herd"
    }

    fn balance(&self, cores: &mut [CoreInfo]) {
        for core in cores.iter_mut() {
            for row in core.thread_infos.iter_mut() {
                row.lcore = 3;
            }
        }
    }
}

#[test]
fn isolated_core_guard() {
    setup();
    let _serial = SCHED_LOCK.lock().unwrap();

    let thread = Thread::new("ut_isolated", CpuMask::single(1)).unwrap();
    let id = thread.id();
    wait_until("thread placed", || {
        Reactors::get_by_core(1).unwrap().thread_ids().contains(&id)
    });

    scheduler::register(Box::new(HerdScheduler));
    assert!(scheduler::set_isolated_core_mask(CpuMask::single(3)));
    scheduler::set(Some("ut_herd")).unwrap();
    scheduler::set_period_us(1_000);

    // several scheduling periods pass; every requested move targets the
    // isolated core and must be refused
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(thread.lw().lcore(), 1);
    assert!(Reactors::get_by_core(1).unwrap().thread_ids().contains(&id));
    assert!(Reactors::get_by_core(3).unwrap().thread_ids().is_empty());

    scheduler::set_period_us(0);
    wait_until("pass drained", || !scheduler::in_progress());
    scheduler::set(Some("static")).unwrap();
    assert!(scheduler::set_isolated_core_mask(CpuMask::new()));

    thread.exit();
    wait_until("thread destroyed", || Thread::get_by_id(id).is_none());
}

#[test]
fn pass_without_policy_cancels() {
    setup();
    let _serial = SCHED_LOCK.lock().unwrap();

    scheduler::set(None).unwrap();
    scheduler::set_period_us(1_000);

    // passes start and immediately cancel; the in-progress latch must not
    // stick
    std::thread::sleep(Duration::from_millis(100));
    scheduler::set_period_us(0);
    wait_until("pass cancelled", || !scheduler::in_progress());

    scheduler::set(Some("static")).unwrap();
}
