//! Stack wired to simulated managers
//!
//! Provides a reusable harness for end-to-end scenarios:
//! - One or two simulated managers on a shared bus
//! - A manual clock advanced one millisecond per step
//! - Recorded completions and events
//!
//! # Example
//!
//! ```no_run
//! use wbms_core::{ResultCode, SimConfig};
//! use wbms_integration_tests::fixtures::SimStack;
//!
//! let mut fixture = SimStack::single(SimConfig::default());
//! let done = fixture.connect();
//! assert_eq!(done.result, ResultCode::Success);
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use wbms_core::{
    Callbacks, Completion, Event, NetworkConfig, NetworkId, PortAddress, SimConfig, SimManager,
    SimNetwork, Stack, StackConfig,
};
use wbms_transport::{Clock, ManualClock, ScriptHandle, ScriptedDriver};

/// First manager link (bus 0, chip select 0)
pub const PRIMARY: PortAddress = PortAddress::new(0, 0);

/// Second manager link on the same bus
pub const SECONDARY: PortAddress = PortAddress::new(0, 1);

/// Longest any scenario waits for a completion, in steps
const MAX_STEPS: u32 = 20_000;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A stack with one open network backed by simulated managers
pub struct SimStack {
    pub stack: Stack,
    pub script: ScriptHandle,
    pub clock: ManualClock,
    pub sim: SimNetwork,
    pub net: NetworkId,
    completions: Arc<Mutex<Vec<Completion>>>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl SimStack {
    /// One manager on `PRIMARY`
    pub fn single(config: SimConfig) -> Self {
        Self::new(vec![(PRIMARY, config)], |_| {})
    }

    /// Two managers on `PRIMARY` and `SECONDARY`
    pub fn dual(primary: SimConfig, secondary: SimConfig) -> Self {
        Self::new(vec![(PRIMARY, primary), (SECONDARY, secondary)], |_| {})
    }

    /// Managers with their behaviour, and a hook to adjust the network
    /// configuration before the network is opened
    pub fn new(
        managers: Vec<(PortAddress, SimConfig)>,
        configure: impl FnOnce(&mut NetworkConfig),
    ) -> Self {
        init_tracing();

        let (driver, script) = ScriptedDriver::new();
        script.set_auto_complete(true);
        let clock = ManualClock::starting_at(10_000);
        let mut stack = Stack::new(
            StackConfig::default(),
            Box::new(driver),
            Arc::new(clock.clone()),
        )
        .expect("default stack config is valid");

        let sim = SimNetwork::new();
        for (address, config) in &managers {
            sim.add(*address, config.clone());
        }
        sim.install(&script);

        let completions: Arc<Mutex<Vec<Completion>>> = Arc::default();
        let events: Arc<Mutex<Vec<Event>>> = Arc::default();
        let (c, e) = (Arc::clone(&completions), Arc::clone(&events));
        let callbacks = Callbacks::new(
            move |_, done| {
                c.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(done.clone());
            },
            move |_, event| {
                e.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.clone());
            },
        );

        let mut config = NetworkConfig::with_managers(managers.iter().map(|(a, _)| *a));
        configure(&mut config);
        let net = stack
            .open_network(config, callbacks)
            .expect("network opens");

        Self {
            stack,
            script,
            clock,
            sim,
            net,
            completions,
            events,
        }
    }

    /// One tick, one foreground pass, one millisecond
    pub fn step(&mut self) {
        self.stack.tick();
        self.stack.process_task();
        self.clock.advance(1);
    }

    /// Current simulated time
    pub fn clock_now(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Run for `steps` milliseconds
    pub fn run(&mut self, steps: u32) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until `done` holds; `false` if it never did
    pub fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..MAX_STEPS {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Step until a completion arrives and return it
    pub fn next_completion(&mut self) -> Completion {
        assert!(
            self.run_until(|f| !f.completions().is_empty()),
            "no completion within {MAX_STEPS} steps"
        );
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(0)
    }

    /// Connect and wait for the result
    pub fn connect(&mut self) -> Completion {
        self.stack.connect(self.net).expect("connect accepted");
        self.next_completion()
    }

    /// Completions not yet taken
    pub fn completions(&self) -> Vec<Completion> {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events delivered so far
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the events delivered so far
    pub fn clear_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Inspect or change one simulated manager
    pub fn manager<T>(&self, address: PortAddress, f: impl FnOnce(&mut SimManager) -> T) -> T {
        self.sim
            .with(address, f)
            .unwrap_or_else(|| panic!("no simulated manager on {address}"))
    }

    /// Check whether the host holds a session with `address`
    pub fn is_connected(&self, address: PortAddress) -> bool {
        self.stack.is_manager_connected(self.net, address)
    }
}
