//! Bootstrap of the engine: core set selection, core claiming, reactor
//! construction, signal handling and the application entry point.

use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc,
    Mutex,
};

use clap::Parser;
use once_cell::sync::{Lazy, OnceCell};

use crate::{
    core::{
        core_lock,
        cpu_cores::{Cores, CpuMask},
        reactor::{enable_interrupt_mode, ReactorState, Reactors},
        scheduler,
        thread::Thread,
    },
    logger,
};

#[derive(Debug, Clone, Parser)]
#[clap(
    name = "reactor-engine",
    about = "Per-core reactor and cross-core event scheduling engine",
    version
)]
pub struct ReactorCliArgs {
    #[clap(short = 'm', default_value = "0x1")]
    /// The reactor mask to be used for starting up the instance.
    pub reactor_mask: String,
    #[clap(short = 'l')]
    /// List of cores to run on instead of using the core mask. When specified
    /// it supersedes the core mask (-m) argument.
    pub core_list: Option<String>,
    #[clap(short = 'L', long = "log-filter")]
    /// Log filter directives, RUST_LOG style.
    pub log_filter: Option<String>,
    #[clap(long = "interrupt-mode")]
    /// Run every reactor interrupt driven from startup instead of polling.
    pub interrupt_mode: bool,
    #[clap(long = "scheduler", default_value = "static")]
    /// The scheduling policy deciding on thread placement.
    pub scheduler: String,
    #[clap(long = "scheduler-period", default_value = "0")]
    /// Scheduling period in microseconds; 0 disables the periodic pass.
    pub scheduler_period: u64,
    #[clap(long = "isolated-core-mask")]
    /// Hex mask of cores exempt from thread migration.
    pub isolated_core_mask: Option<String>,
    #[clap(long = "disable-core-locks")]
    /// Do not claim the per-core lock files before starting.
    pub disable_core_locks: bool,
    #[clap(long, hide = true)]
    /// Skip install of the signal handler which triggers graceful
    /// termination.
    pub skip_sig_handler: bool,
}

/// Defaults are redefined here in case of using it during tests.
impl Default for ReactorCliArgs {
    fn default() -> Self {
        Self {
            reactor_mask: "0x1".into(),
            core_list: None,
            log_filter: None,
            interrupt_mode: false,
            scheduler: "static".into(),
            scheduler_period: 0,
            isolated_core_mask: None,
            disable_core_locks: false,
            skip_sig_handler: false,
        }
    }
}

/// Global exit code of the program, initially set to -1 to capture double
/// shutdown during test cases.
pub static GLOBAL_RC: Lazy<Arc<Mutex<i32>>> = Lazy::new(|| Arc::new(Mutex::new(-1)));

/// keep track if we have received a signal already
pub static SIG_RECEIVED: Lazy<AtomicBool> = Lazy::new(|| AtomicBool::new(false));

static DEFAULT_ENV: OnceCell<ReactorEnvironment> = OnceCell::new();

/// Request an orderly stop of the whole environment with the given exit
/// code. Callable from any thread.
pub fn environment_stop(rc: i32) {
    info!("Stopping the reactor environment (rc={})", rc);
    *GLOBAL_RC.lock().unwrap() = rc;
    Reactors::stop();
}

/// called on SIGINT and SIGTERM
fn signal_handler(signo: i32) {
    if SIG_RECEIVED.swap(true, SeqCst) {
        return;
    }
    warn!("Received SIGNO: {}", signo);
    // a sleeping master reactor needs the kick to notice the flag
    if let Some(master) = Reactors::get_by_core(Cores::first()) {
        master.notify_event_queue();
    }
}

#[derive(Debug, Clone)]
pub struct ReactorEnvironment {
    pub name: String,
    reactor_mask: String,
    core_list: Option<String>,
    log_filter: Option<String>,
    interrupt_mode: bool,
    scheduler: String,
    scheduler_period: u64,
    isolated_core_mask: Option<String>,
    disable_core_locks: bool,
    skip_sig_handler: bool,
    init_thread: Option<Thread>,
}

impl Default for ReactorEnvironment {
    fn default() -> Self {
        Self::from_args(ReactorCliArgs::default())
    }
}

impl ReactorEnvironment {
    pub fn new(args: ReactorCliArgs) -> Self {
        let env = Self::from_args(args);
        DEFAULT_ENV.get_or_init(|| env.clone());
        env
    }

    fn from_args(args: ReactorCliArgs) -> Self {
        Self {
            name: "reactor_engine".into(),
            reactor_mask: args.reactor_mask,
            core_list: args.core_list,
            log_filter: args.log_filter,
            interrupt_mode: args.interrupt_mode,
            scheduler: args.scheduler,
            scheduler_period: args.scheduler_period,
            isolated_core_mask: args.isolated_core_mask,
            disable_core_locks: args.disable_core_locks,
            skip_sig_handler: args.skip_sig_handler,
            init_thread: None,
        }
    }

    /// Get the global environment (first created on new) or otherwise the
    /// default one (used by the tests).
    pub fn global_or_default() -> Self {
        match DEFAULT_ENV.get() {
            Some(env) => env.clone(),
            None => ReactorEnvironment::default(),
        }
    }

    /// configure signal handling
    fn install_signal_handlers(&self) {
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
                signal_handler(signal_hook::consts::SIGTERM)
            })
        }
        .expect("failed to install the SIGTERM handler");

        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
                signal_handler(signal_hook::consts::SIGINT)
            })
        }
        .expect("failed to install the SIGINT handler");
    }

    /// Initialize the engine core: call this before all else. Startup
    /// failures here are unrecoverable and abort the process.
    pub fn init(mut self) -> Self {
        // set up the logger as soon as possible
        logger::init(self.log_filter.as_deref());

        let mask = match &self.core_list {
            Some(list) => CpuMask::from_core_list(list),
            None => CpuMask::parse(&self.reactor_mask),
        }
        .unwrap_or_else(|e| panic!("Failed to parse the core configuration: {}", e));

        Cores::init(&mask).unwrap_or_else(|e| panic!("Failed to fix the core set: {}", e));

        info!(
            "Total number of cores available: {} ({})",
            Cores::count(),
            mask
        );

        if !self.disable_core_locks {
            if let Err(e) = core_lock::claim_cpu_cores() {
                panic!("Failed to claim CPU cores: {}", e);
            }
        }

        if self.interrupt_mode {
            info!("Running in interrupt mode on all cores");
            enable_interrupt_mode();
        }

        // allocate a reactor per core
        Reactors::init();

        scheduler::set(Some(&self.scheduler))
            .unwrap_or_else(|e| panic!("Failed to select scheduler '{}': {}", self.scheduler, e));
        scheduler::set_period_us(self.scheduler_period);

        if let Some(isolated) = &self.isolated_core_mask {
            let isolated = CpuMask::parse(isolated)
                .unwrap_or_else(|e| panic!("Failed to parse the isolated core mask: {}", e));
            if !scheduler::set_isolated_core_mask(isolated) {
                panic!("Isolated core mask is not included in the app core mask");
            }
        }

        if !self.skip_sig_handler {
            self.install_signal_handlers();
        }

        // construct one main init thread; it is used to bootstrap and to run
        // the application entry point
        let init_thread = Thread::new("init_thread", CpuMask::single(Cores::first()))
            .unwrap_or_else(|e| panic!("Failed to create the init thread: {}", e));
        info!("Init thread ID {}", init_thread.id());
        self.init_thread = Some(init_thread);

        self
    }

    /// Start all reactors and run `f` on the init thread once the loops are
    /// live. Blocks until the environment is stopped, returning the exit
    /// code passed to [`environment_stop`].
    pub fn start<F>(self, f: F) -> Result<i32, crate::core::CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        // the calling thread becomes the master core's reactor
        Cores::enter(Cores::first());
        Cores::pin_current(Cores::first());

        Reactors::set_state(ReactorState::Running);

        // launch the remote cores; the current core runs the master reactor
        // inline below
        for &core in Cores::list() {
            Reactors::launch_remote(core)?;
        }

        self.init_thread
            .as_ref()
            .expect("environment must be initialized before start")
            .send_msg(f)?;

        Reactors::get_by_core(Cores::first())
            .expect("master reactor must exist")
            .run();

        // wait for all other cores to exit before we unblock
        Reactors::wait_all();
        Reactors::set_state(ReactorState::Shutdown);

        if !self.disable_core_locks {
            core_lock::unclaim_cpu_cores();
        }

        info!("reactors stopped");
        Ok(*GLOBAL_RC.lock().unwrap())
    }
}
