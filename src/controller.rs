use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::command::{OperationRequest, Runner};
use crate::config::VmConfig;
use crate::output::Output;
use crate::probe::Prober;

const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Default period of the background poll timer.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(30);

/// What the controller is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing in flight
    Idle,
    /// A start/stop operation is in flight
    OperationRunning,
    /// A status poll is in flight
    PollingStatus,
}

/// Single-flight state machine for operations and polls.
///
/// At most one operation and at most one poll may be in flight, and never
/// both at once. Requests arriving in a busy state are dropped, not
/// queued; operations take priority in the sense that status stays stale
/// until the operation completes.
#[derive(Debug)]
pub struct Machine {
    state: State,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A fresh machine, idle.
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// An operation was requested. Returns true if it may start.
    pub fn on_operate(&mut self) -> bool {
        match self.state {
            State::Idle => {
                self.state = State::OperationRunning;
                true
            }
            _ => false,
        }
    }

    /// A poll was requested. Returns true if it may start.
    pub fn on_poll(&mut self) -> bool {
        match self.state {
            State::Idle => {
                self.state = State::PollingStatus;
                true
            }
            _ => false,
        }
    }

    /// The in-flight operation finished.
    ///
    /// Returns true if exactly one settle poll should be scheduled, which
    /// is the case only for successful operations.
    pub fn on_operation_end(&mut self, success: bool) -> bool {
        self.state = State::Idle;
        success
    }

    /// The in-flight poll finished.
    pub fn on_probe_end(&mut self) {
        self.state = State::Idle;
    }
}

/// Events consumed by the controller loop.
pub enum Event {
    /// User intent: run a start/stop operation.
    Operate(OperationRequest),
    /// Poll request for this config (timer tick, selection, settle poll).
    Poll(VmConfig),
    /// Forwarded worker update.
    Update(Output),
    /// Stop the controller loop.
    Shutdown,
}

/// Orchestrates runner and prober workers.
///
/// Owns the [`Machine`] and the event channel. Workers never share state
/// with the controller; everything crosses the boundary as [`Output`]
/// updates relayed through the event loop, which also keeps the
/// presentation stream in emission order.
pub struct Controller {
    machine: Machine,
    script: PathBuf,
    prober: Prober,
    settle_delay: Duration,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    /// Target of the settle poll once the in-flight operation ends.
    in_flight: Option<VmConfig>,
}

impl Controller {
    /// Construct a controller around the manager `script` and `prober`.
    pub fn new(script: PathBuf, prober: Prober) -> Self {
        let (sender, receiver) = channel();
        Self {
            machine: Machine::new(),
            script,
            prober,
            settle_delay: SETTLE_DELAY,
            sender,
            receiver,
            in_flight: None,
        }
    }

    /// Override the post-operation settle delay. Mostly useful for tests.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Handle used to inject events into the running loop.
    pub fn handle(&self) -> Sender<Event> {
        self.sender.clone()
    }

    /// Relay worker updates from `rx` into the event loop.
    fn forward(&self, rx: Receiver<Output>) {
        let events = self.sender.clone();
        thread::spawn(move || {
            for update in rx {
                if events.send(Event::Update(update)).is_err() {
                    break;
                }
            }
        });
    }

    fn start_operation(&mut self, request: OperationRequest, presenter: &Sender<Output>) {
        if !self.machine.on_operate() {
            debug!("operation request dropped while {:?}", self.machine.state());
            return;
        }

        let _ = presenter.send(Output::OperationStart(request.action));
        self.in_flight = Some(request.config.clone());

        let (tx, rx) = channel();
        self.forward(rx);
        let runner = Runner::new(self.script.clone(), request, tx);
        thread::spawn(move || runner.run());
    }

    fn start_poll(&mut self, vm: VmConfig, presenter: &Sender<Output>) {
        if !self.machine.on_poll() {
            debug!("poll request dropped while {:?}", self.machine.state());
            return;
        }

        let _ = presenter.send(Output::ProbeStart);

        let (tx, rx) = channel();
        self.forward(rx);
        let prober = self.prober.clone();
        thread::spawn(move || {
            let status = prober.probe(&vm);
            let _ = tx.send(Output::ProbeEnd(status));
        });
    }

    /// Inject one poll for `vm` after the settle delay, giving the
    /// provider time to reflect the operation in its describe API.
    fn schedule_settle_poll(&self, vm: VmConfig) {
        let events = self.sender.clone();
        let delay = self.settle_delay;
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = events.send(Event::Poll(vm));
        });
    }

    /// Run the event loop until a `Shutdown` event arrives.
    ///
    /// Worker updates are forwarded to `presenter` in emission order.
    pub fn run(mut self, presenter: Sender<Output>) {
        loop {
            let event = match self.receiver.recv() {
                Ok(e) => e,
                Err(_) => break,
            };

            match event {
                Event::Operate(request) => self.start_operation(request, &presenter),
                Event::Poll(vm) => self.start_poll(vm, &presenter),
                Event::Update(update) => {
                    match &update {
                        Output::OperationEnd(result) => {
                            let success = matches!(result, Ok(0));
                            let settle = self.machine.on_operation_end(success);
                            if let Some(vm) = self.in_flight.take() {
                                if settle {
                                    self.schedule_settle_poll(vm);
                                }
                            }
                        }
                        Output::ProbeEnd(_) => self.machine.on_probe_end(),
                        _ => (),
                    }

                    if presenter.send(update).is_err() {
                        break;
                    }
                }
                Event::Shutdown => break,
            }
        }
    }
}

/// Inject a poll for `vm` every `period` until the controller hangs up.
///
/// The timer fires unconditionally; the drop rules live in the machine.
pub fn spawn_poll_timer(handle: Sender<Event>, vm: VmConfig, period: Duration) {
    thread::spawn(move || loop {
        thread::sleep(period);
        if handle.send(Event::Poll(vm.clone())).is_err() {
            break;
        }
    });
}
