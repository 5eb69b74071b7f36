#![allow(dead_code)]

use std::{
    sync::mpsc,
    time::{Duration, Instant},
};

use reactor_engine::core::{Cores, Event, ReactorEnvironment, ReactorState, Reactors};

/// Spin until the condition holds, failing the test after a grace period.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Run a closure on the given core through the event path and hand its
/// result back.
pub fn on_core<R, F>(core: u32, f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    Event::spawn_on(core, move || {
        tx.send(f()).ok();
    })
    .map_err(|_| "event pool exhausted")
    .unwrap();
    rx.recv_timeout(Duration::from_secs(10))
        .expect("no response from the target core")
}

/// Run the environment on a background OS thread and block until every
/// reactor demonstrably processes events. Returns the handle yielding the
/// exit code.
pub fn start_background(env: ReactorEnvironment) -> std::thread::JoinHandle<i32> {
    let handle = std::thread::spawn(move || env.start(|| {}).unwrap());

    wait_until("reactors running", || {
        Reactors::state() == ReactorState::Running
    });
    for &core in Cores::list() {
        on_core(core, || {});
    }

    handle
}
