//! Startup and shutdown of a whole environment: core lock files appear with
//! the owner pid while running and disappear on clean shutdown, every
//! thread is wound down, and the exit code travels through.

use std::path::Path;

use reactor_engine::core::{
    environment_stop,
    CpuMask,
    ReactorCliArgs,
    ReactorEnvironment,
    ReactorState,
    Reactors,
    Thread,
};

pub mod common;
use common::{start_background, wait_until};

fn lock_path(core: u32) -> String {
    format!("/var/tmp/reactor_engine_cpu_lock_{:03}", core)
}

#[test]
fn clean_shutdown() {
    let args = ReactorCliArgs {
        core_list: Some("0-1".into()),
        skip_sig_handler: true,
        ..Default::default()
    };
    let env = ReactorEnvironment::new(args).init();

    // both cores are claimed and the lock files name this process
    for core in 0 .. 2 {
        let content = std::fs::read_to_string(lock_path(core)).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    let handle = start_background(env);

    // leave a worker running; shutdown must exit and destroy it
    let thread = Thread::new("ut_leftover", CpuMask::from_core_list("0-1").unwrap()).unwrap();
    let id = thread.id();
    wait_until("thread placed", || {
        Reactors::iter().any(|r| r.thread_ids().contains(&id))
    });

    environment_stop(42);
    assert_eq!(handle.join().unwrap(), 42);

    assert_eq!(Reactors::state(), ReactorState::Shutdown);
    assert!(Thread::get_by_id(id).is_none());
    for reactor in Reactors::iter() {
        assert_eq!(reactor.thread_count(), 0);
    }
    for core in 0 .. 2 {
        assert!(
            !Path::new(&lock_path(core)).exists(),
            "lock file of core {} must be removed",
            core
        );
    }
}
