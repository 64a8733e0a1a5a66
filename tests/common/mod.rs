// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared harness for conductor tests: an in-process mock driver behind the
// transport traits, a manual clock, and a counters region per test.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use libipc_conductor::agent::Agent;
use libipc_conductor::clock::{EpochClock, ManualClock, NanoClock};
use libipc_conductor::command::{CommandMessage, DriverCommand, DriverEvent, ToClients, ToDriver};
use libipc_conductor::counters::{channel_status, CountersManager};
use libipc_conductor::handlers::ErrorHandler;
use libipc_conductor::idle::IdleStrategy;
use libipc_conductor::{ClientConductor, Context, Error, Result, ShmHandle, ShmOpenMode};

pub const CLIENT_ID: i64 = 7;
pub const FIRST_CORRELATION_ID: i64 = 42;
pub const START_NS: i64 = 1_000_000_000_000;
pub const LOG_LENGTH: usize = 64 * 1024;

pub const DRIVER_TIMEOUT: Duration = Duration::from_millis(500);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);
pub const INTER_SERVICE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const RESOURCE_LINGER: Duration = Duration::from_millis(100);

const CHANNEL_STATUS_TYPE_ID: i32 = 7;
const PUBLICATION_LIMIT_TYPE_ID: i32 = 1;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Route library events to the test output; filter with `IPCC_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IPCC_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{n}_{}", std::process::id())
}

/// Replaces the default reply to a command. `None` falls back to the default.
pub type ReplyOverride = Box<dyn FnMut(&CommandMessage) -> Option<Vec<DriverEvent>> + Send>;

struct MockState {
    dir: String,
    clock: Arc<ManualClock>,
    counters: Arc<CountersManager>,
    next_correlation_id: i64,
    frozen_keepalive_ms: Option<i64>,
    sent: Vec<CommandMessage>,
    pending: VecDeque<CommandMessage>,
    events: VecDeque<DriverEvent>,
    respond_on_receive: bool,
    broken: bool,
    reply_override: Option<ReplyOverride>,
    log_files: HashMap<String, ShmHandle>,
    shared_publications: HashMap<(String, i32), (i64, String)>,
    counter_ids: HashMap<i64, i32>,
    agent_closed: bool,
}

impl MockState {
    fn create_log_file(&mut self, name: &str) {
        if self.log_files.contains_key(name) {
            return;
        }
        let shm = ShmHandle::acquire(name, LOG_LENGTH, ShmOpenMode::CreateOrOpen).expect("create log file");
        self.log_files.insert(name.to_owned(), shm);
    }

    fn status_counter(&self, label: &str) -> i32 {
        let id = self
            .counters
            .allocate(CHANNEL_STATUS_TYPE_ID, &[], label)
            .expect("allocate channel status");
        self.counters.set_value(id, channel_status::ACTIVE);
        id
    }

    fn publication_ready(&mut self, msg: &CommandMessage, channel: &str, stream_id: i32, exclusive: bool) -> DriverEvent {
        let correlation_id = msg.correlation_id;
        let key = (channel.to_owned(), stream_id);
        let (registration_id, log_file_name) = match self.shared_publications.get(&key) {
            Some(existing) if !exclusive => existing.clone(),
            _ => {
                let file = format!("{}-log-{correlation_id}", self.dir);
                self.create_log_file(&file);
                if !exclusive {
                    self.shared_publications.insert(key, (correlation_id, file.clone()));
                }
                (correlation_id, file)
            }
        };
        let publication_limit_id = self
            .counters
            .allocate(PUBLICATION_LIMIT_TYPE_ID, &[], "pub-lmt")
            .expect("allocate publication limit");
        DriverEvent::PublicationReady {
            correlation_id,
            registration_id,
            stream_id,
            session_id: (registration_id % 1000) as i32,
            publication_limit_id,
            channel_status_id: self.status_counter("snd-channel"),
            log_file_name,
            exclusive,
        }
    }

    fn default_reply(&mut self, msg: &CommandMessage) -> Vec<DriverEvent> {
        let correlation_id = msg.correlation_id;
        let success = DriverEvent::OperationSuccess { correlation_id };
        match &msg.command {
            DriverCommand::AddPublication { channel, stream_id } => {
                vec![self.publication_ready(msg, channel, *stream_id, false)]
            }
            DriverCommand::AddExclusivePublication { channel, stream_id } => {
                vec![self.publication_ready(msg, channel, *stream_id, true)]
            }
            DriverCommand::AddSubscription { .. } => vec![DriverEvent::SubscriptionReady {
                correlation_id,
                channel_status_id: self.status_counter("rcv-channel"),
            }],
            DriverCommand::AddCounter { type_id, key, label } => {
                let counter_id = self.counters.allocate(*type_id, key, label).expect("allocate counter");
                self.counters.set_registration_id(counter_id, correlation_id);
                self.counter_ids.insert(correlation_id, counter_id);
                vec![DriverEvent::CounterReady {
                    correlation_id,
                    counter_id,
                }]
            }
            DriverCommand::RemoveCounter { registration_id } => {
                let mut events = vec![success];
                if let Some(counter_id) = self.counter_ids.remove(registration_id) {
                    self.counters.free(counter_id);
                    events.push(DriverEvent::UnavailableCounter {
                        registration_id: *registration_id,
                        counter_id,
                    });
                }
                events
            }
            DriverCommand::RemovePublication { .. }
            | DriverCommand::RemoveSubscription { .. }
            | DriverCommand::AddDestination { .. }
            | DriverCommand::RemoveDestination { .. }
            | DriverCommand::AddRcvDestination { .. }
            | DriverCommand::RemoveRcvDestination { .. } => vec![success],
            DriverCommand::ClientKeepalive | DriverCommand::ClientClose => Vec::new(),
        }
    }

    /// Answer every command not yet answered. Returns how many there were.
    fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some(msg) = self.pending.pop_front() {
            let reply = match self.reply_override.as_mut().and_then(|f| f(&msg)) {
                Some(events) => events,
                None => self.default_reply(&msg),
            };
            self.events.extend(reply);
            count += 1;
        }
        count
    }
}

/// A driver stand-in the conductor talks to through the transport traits.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new(dir: &str, clock: Arc<ManualClock>, counters: Arc<CountersManager>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                dir: dir.to_owned(),
                clock,
                counters,
                next_correlation_id: FIRST_CORRELATION_ID,
                frozen_keepalive_ms: None,
                sent: Vec::new(),
                pending: VecDeque::new(),
                events: VecDeque::new(),
                respond_on_receive: true,
                broken: false,
                reply_override: None,
                log_files: HashMap::new(),
                shared_publications: HashMap::new(),
                counter_ids: HashMap::new(),
                agent_closed: false,
            })),
        }
    }

    pub fn to_driver(&self) -> Box<dyn ToDriver> {
        Box::new(MockToDriver { state: Arc::clone(&self.state) })
    }

    pub fn to_clients(&self) -> Box<dyn ToClients> {
        Box::new(MockToClients { state: Arc::clone(&self.state) })
    }

    /// An agent that answers commands from its duty cycle. Only this agent
    /// answers once `respond_on_receive(false)` is set.
    pub fn agent(&self) -> Box<dyn Agent> {
        Box::new(MockDriverAgent { state: Arc::clone(&self.state) })
    }

    pub fn respond_on_receive(&self, enabled: bool) {
        self.state.lock().respond_on_receive = enabled;
    }

    pub fn override_replies(&self, f: impl FnMut(&CommandMessage) -> Option<Vec<DriverEvent>> + Send + 'static) {
        self.state.lock().reply_override = Some(Box::new(f));
    }

    pub fn push_event(&self, event: DriverEvent) {
        self.state.lock().events.push_back(event);
    }

    pub fn create_log_file(&self, name: &str) {
        self.state.lock().create_log_file(name);
    }

    pub fn freeze_keepalive(&self, ms: i64) {
        self.state.lock().frozen_keepalive_ms = Some(ms);
    }

    /// Make the event channel fail and report itself invalid.
    pub fn break_channel(&self) {
        self.state.lock().broken = true;
    }

    pub fn sent(&self) -> Vec<CommandMessage> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn count_sent(&self, pred: impl Fn(&DriverCommand) -> bool) -> usize {
        self.state.lock().sent.iter().filter(|m| pred(&m.command)).count()
    }

    pub fn agent_closed(&self) -> bool {
        self.state.lock().agent_closed
    }
}

struct MockToDriver {
    state: Arc<Mutex<MockState>>,
}

impl ToDriver for MockToDriver {
    fn client_id(&self) -> i64 {
        CLIENT_ID
    }

    fn next_correlation_id(&mut self) -> i64 {
        let mut st = self.state.lock();
        let id = st.next_correlation_id;
        st.next_correlation_id += 1;
        id
    }

    fn send(&mut self, message: CommandMessage) -> Result<()> {
        let mut st = self.state.lock();
        st.sent.push(message.clone());
        st.pending.push_back(message);
        Ok(())
    }

    fn time_of_last_driver_keepalive_ms(&self) -> i64 {
        let st = self.state.lock();
        st.frozen_keepalive_ms.unwrap_or_else(|| st.clock.time())
    }
}

struct MockToClients {
    state: Arc<Mutex<MockState>>,
}

impl ToClients for MockToClients {
    fn receive(&mut self, sink: &mut Vec<DriverEvent>) -> Result<usize> {
        let mut st = self.state.lock();
        if st.broken {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "event channel overrun",
            )));
        }
        if st.respond_on_receive {
            st.process_pending();
        }
        let count = st.events.len();
        sink.extend(st.events.drain(..));
        Ok(count)
    }

    fn is_invalid(&self) -> bool {
        self.state.lock().broken
    }
}

struct MockDriverAgent {
    state: Arc<Mutex<MockState>>,
}

impl Agent for MockDriverAgent {
    fn do_work(&mut self) -> Result<usize> {
        Ok(self.state.lock().process_pending())
    }

    fn on_close(&mut self) {
        self.state.lock().agent_closed = true;
    }

    fn role_name(&self) -> &str {
        "mock-driver"
    }
}

/// Moves a manual clock forward on every idle, so awaiting a response
/// burns simulated time instead of wall time.
pub struct AdvancingIdle {
    clock: Arc<ManualClock>,
    step_ns: i64,
}

impl AdvancingIdle {
    pub fn new(clock: Arc<ManualClock>, step: Duration) -> Self {
        Self {
            clock,
            step_ns: step.as_nanos() as i64,
        }
    }
}

impl IdleStrategy for AdvancingIdle {
    fn idle(&mut self) {
        self.clock.advance_ns(self.step_ns);
    }

    fn reset(&mut self) {}
}

/// Every error the conductor reported, as its `Debug` text.
#[derive(Clone, Default)]
pub struct ErrorLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    pub fn handler(&self) -> ErrorHandler {
        let entries = Arc::clone(&self.entries);
        Arc::new(move |e: &Error| entries.lock().push(format!("{e:?}")))
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, variant: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.starts_with(variant)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// One mock driver, its counters and clock, and the error log of the
/// conductor built on top.
pub struct Harness {
    pub dir: String,
    pub clock: Arc<ManualClock>,
    pub counters: Arc<CountersManager>,
    pub driver: MockDriver,
    pub errors: ErrorLog,
}

impl Harness {
    pub fn new(prefix: &str) -> Self {
        init_tracing();
        let dir = unique_name(prefix);
        let clock = Arc::new(ManualClock::new(START_NS));
        let counters = Arc::new(CountersManager::create(&dir, 128).expect("counters"));
        // Status id 0 reads as initializing; keep real status counters off it.
        counters.allocate(0, &[], "reserved").expect("reserve counter 0");
        let driver = MockDriver::new(&dir, Arc::clone(&clock), Arc::clone(&counters));
        Self {
            dir,
            clock,
            counters,
            driver,
            errors: ErrorLog::default(),
        }
    }

    pub fn log_file(&self, suffix: &str) -> String {
        let name = format!("{}-{suffix}", self.dir);
        self.driver.create_log_file(&name);
        name
    }

    /// A context wired to the mock driver with short, simulated timeouts.
    pub fn context(&self) -> Context {
        let nano: Arc<dyn NanoClock> = self.clock.clone();
        let epoch: Arc<dyn EpochClock> = self.clock.clone();
        Context::new()
            .dir(self.dir.clone())
            .client_name("test-conductor")
            .driver_timeout(DRIVER_TIMEOUT)
            .keep_alive_interval(KEEPALIVE_INTERVAL)
            .inter_service_timeout(INTER_SERVICE_TIMEOUT)
            .resource_linger_duration(RESOURCE_LINGER)
            .error_handler(self.errors.handler())
            .to_driver(self.driver.to_driver())
            .to_clients(self.driver.to_clients())
            .counters_reader(Arc::clone(self.counters.reader()))
            .nano_clock(nano)
            .epoch_clock(epoch)
            .awaiting_idle_strategy(Box::new(AdvancingIdle::new(
                Arc::clone(&self.clock),
                Duration::from_millis(1),
            )))
    }

    pub fn conductor_from(&self, ctx: Context) -> Arc<ClientConductor> {
        ClientConductor::new(ctx.conclude().expect("conclude")).expect("conductor")
    }

    pub fn conductor(&self) -> Arc<ClientConductor> {
        self.conductor_from(self.context())
    }

    /// Advance past the idle sleep so the next duty cycle runs its checks.
    pub fn tick(&self, conductor: &ClientConductor, ms: i64) -> Result<usize> {
        self.clock.advance_ms(ms);
        conductor.do_work()
    }
}
