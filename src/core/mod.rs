//!
//! core contains the primary abstractions of the engine: cores and cpu
//! masks, events and their rings, lightweight threads, the per-core
//! reactors, and the scheduling pass that rebalances threads between them.

use nix::errno::Errno;
use snafu::Snafu;

pub use cpu_cores::{AtomicCpuMask, Cores, CpuMask, LCORE_ANY, MAX_CORES};
pub use env::{environment_stop, ReactorCliArgs, ReactorEnvironment, GLOBAL_RC, SIG_RECEIVED};
pub use event::{Event, EventFn, EventRef, EVENT_BATCH_SIZE};
pub use fd_group::{eventfd, eventfd_write, FdGroup, FdType};
pub use mempool::MemPool;
pub use reactor::{
    context_switch_monitor_enabled,
    enable_context_switch_monitor,
    interrupt_mode_is_enabled,
    Reactor,
    ReactorState,
    ReactorStats,
    Reactors,
    REACTOR_LIST,
};
pub use thread::{
    thread_lib_fini,
    thread_lib_init,
    Thread,
    ThreadOp,
    ThreadStats,
    THREAD_MSG_BATCH_SIZE,
};
pub use ticks::{ticks, ticks_hz};

pub mod core_lock;
mod cpu_cores;
mod env;
mod event;
mod fd_group;
pub mod governor;
mod mempool;
mod reactor;
pub mod scheduler;
mod thread;
mod ticks;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CoreError {
    #[snafu(display("reactor for core {} not found", core))]
    ReactorNotFound {
        core: u32,
    },
    #[snafu(display("reactor on core {} has no interrupt facilities", core))]
    InterruptsNotSupported {
        core: u32,
    },
    #[snafu(display("only permitted within the scheduling reactor"))]
    NotSchedulingReactor {},
    #[snafu(display("reactor on core {} is already switching interrupt mode", core))]
    InterruptModeInProgress {
        core: u32,
    },
    #[snafu(display("invalid core mask '{}'", mask))]
    InvalidCoreMask {
        mask: String,
    },
    #[snafu(display("invalid core list '{}'", list))]
    InvalidCoreList {
        list: String,
    },
    #[snafu(display("core {} is not part of the core set", core))]
    InvalidCore {
        core: u32,
    },
    #[snafu(display("failed to launch reactor on core {}", core))]
    ReactorLaunch {
        core: u32,
        source: Errno,
    },
    #[snafu(display("event pool exhausted"))]
    EventPoolExhausted {},
    #[snafu(display("thread '{}' could not be scheduled", name))]
    ThreadSchedule {
        name: String,
    },
    #[snafu(display("thread {} has already exited", id))]
    ThreadExited {
        id: u64,
    },
    #[snafu(display("thread scheduling operations are not installed"))]
    ThreadOpsNotInstalled {},
    #[snafu(display("failed to create fd group '{}'", name))]
    FdGroupCreate {
        name: String,
        source: Errno,
    },
    #[snafu(display("failed to add fd {} to the fd group", fd))]
    FdGroupAdd {
        fd: i32,
        source: Errno,
    },
    #[snafu(display("fd {} is not part of the fd group", fd))]
    FdGroupRemove {
        fd: i32,
    },
    #[snafu(display("failed to wait on the fd group"))]
    FdGroupWait {
        source: Errno,
    },
    #[snafu(display("failed to create an eventfd"))]
    EventFd {
        source: Errno,
    },
    #[snafu(display("no scheduler named '{}' is registered", name))]
    SchedulerNotFound {
        name: String,
    },
    #[snafu(display("no governor named '{}' is registered", name))]
    GovernorNotFound {
        name: String,
    },
    #[snafu(display("operation not supported by the governor"))]
    GovernorNotSupported {},
    #[snafu(display("cannot lock core {}, already claimed by process {}", core, pid))]
    CoreClaimed {
        core: u32,
        pid: i32,
    },
    #[snafu(display("failed to access core lock file '{}'", path))]
    CoreLockFile {
        path: String,
        source: std::io::Error,
    },
}
