// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client configuration: timeouts, the shm directory, and the collaborators
// a client is wired to (transports, counters, clocks, idle strategies,
// callbacks). Anything left unset is filled in by `conclude`.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentInvoker;
use crate::clock::{EpochClock, NanoClock, SystemEpochClock, SystemNanoClock};
use crate::command::{ToClients, ToDriver};
use crate::counters::CountersReader;
use crate::error::{Error, Result};
use crate::handlers::{
    default_error_handler, AvailableCounterHandler, AvailableImageHandler, CloseHandler, ErrorHandler,
    UnavailableCounterHandler, UnavailableImageHandler,
};
use crate::idle::{BackoffIdleStrategy, IdleStrategy, SleepingIdleStrategy};

pub const DEFAULT_DIR: &str = "ipcc-default";

pub const DIR_ENV: &str = "IPCC_DIR";
pub const DRIVER_TIMEOUT_ENV: &str = "IPCC_DRIVER_TIMEOUT_MS";
pub const KEEPALIVE_INTERVAL_ENV: &str = "IPCC_KEEPALIVE_INTERVAL_MS";
pub const INTER_SERVICE_TIMEOUT_ENV: &str = "IPCC_INTER_SERVICE_TIMEOUT_MS";
pub const RESOURCE_LINGER_ENV: &str = "IPCC_RESOURCE_LINGER_MS";
pub const CLOSE_LINGER_ENV: &str = "IPCC_CLOSE_LINGER_MS";
pub const PRE_TOUCH_ENV: &str = "IPCC_PRE_TOUCH";

/// Minimum gap between liveness checks in the service loop.
pub const IDLE_SLEEP: Duration = Duration::from_millis(16);

/// Client configuration
pub struct Context {
    /// Prefix of every shared memory name the client opens
    pub dir: String,

    /// Name used for the conductor thread and in logs
    pub client_name: String,

    /// How long to wait for a driver response, and the driver keep-alive age
    /// after which the driver is presumed dead
    pub driver_timeout: Duration,

    /// How often the heartbeat counter is refreshed
    pub keep_alive_interval: Duration,

    /// Longest allowed gap between two runs of the service loop
    pub inter_service_timeout: Duration,

    /// How long a released log buffer stays mapped
    pub resource_linger_duration: Duration,

    /// Extra wait on close before lingering buffers are deleted
    pub close_linger_duration: Duration,

    /// Touch every page of a newly mapped log buffer
    pub pre_touch_mapped_memory: bool,

    /// Drive the conductor from the application's own loop instead of a
    /// dedicated thread
    pub use_conductor_agent_invoker: bool,

    pub(crate) error_handler: ErrorHandler,
    pub(crate) available_image_handler: Option<AvailableImageHandler>,
    pub(crate) unavailable_image_handler: Option<UnavailableImageHandler>,
    pub(crate) available_counter_handler: Option<AvailableCounterHandler>,
    pub(crate) unavailable_counter_handler: Option<UnavailableCounterHandler>,
    pub(crate) close_handler: Option<CloseHandler>,
    pub(crate) to_driver: Option<Box<dyn ToDriver>>,
    pub(crate) to_clients: Option<Box<dyn ToClients>>,
    pub(crate) counters_reader: Option<Arc<CountersReader>>,
    pub(crate) nano_clock: Arc<dyn NanoClock>,
    pub(crate) epoch_clock: Arc<dyn EpochClock>,
    pub(crate) awaiting_idle_strategy: Box<dyn IdleStrategy>,
    pub(crate) conductor_idle_strategy: Box<dyn IdleStrategy>,
    pub(crate) driver_agent_invoker: Option<AgentInvoker>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            dir: DEFAULT_DIR.to_owned(),
            client_name: String::new(),
            driver_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_millis(500),
            inter_service_timeout: Duration::from_secs(10),
            resource_linger_duration: Duration::from_secs(3),
            close_linger_duration: Duration::ZERO,
            pre_touch_mapped_memory: false,
            use_conductor_agent_invoker: false,
            error_handler: default_error_handler(),
            available_image_handler: None,
            unavailable_image_handler: None,
            available_counter_handler: None,
            unavailable_counter_handler: None,
            close_handler: None,
            to_driver: None,
            to_clients: None,
            counters_reader: None,
            nano_clock: Arc::new(SystemNanoClock),
            epoch_clock: Arc::new(SystemEpochClock),
            awaiting_idle_strategy: Box::new(SleepingIdleStrategy::new(Duration::from_millis(1))),
            conductor_idle_strategy: Box::new(BackoffIdleStrategy::default()),
            driver_agent_invoker: None,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring malformed duration");
            None
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `IPCC_*` environment variables present.
    pub fn from_env() -> Self {
        let mut ctx = Self::default();
        if let Ok(dir) = std::env::var(DIR_ENV) {
            ctx.dir = dir;
        }
        if let Some(d) = env_millis(DRIVER_TIMEOUT_ENV) {
            ctx.driver_timeout = d;
        }
        if let Some(d) = env_millis(KEEPALIVE_INTERVAL_ENV) {
            ctx.keep_alive_interval = d;
        }
        if let Some(d) = env_millis(INTER_SERVICE_TIMEOUT_ENV) {
            ctx.inter_service_timeout = d;
        }
        if let Some(d) = env_millis(RESOURCE_LINGER_ENV) {
            ctx.resource_linger_duration = d;
        }
        if let Some(d) = env_millis(CLOSE_LINGER_ENV) {
            ctx.close_linger_duration = d;
        }
        if let Ok(v) = std::env::var(PRE_TOUCH_ENV) {
            ctx.pre_touch_mapped_memory = v == "true" || v == "1";
        }
        ctx
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn inter_service_timeout(mut self, timeout: Duration) -> Self {
        self.inter_service_timeout = timeout;
        self
    }

    pub fn resource_linger_duration(mut self, linger: Duration) -> Self {
        self.resource_linger_duration = linger;
        self
    }

    pub fn close_linger_duration(mut self, linger: Duration) -> Self {
        self.close_linger_duration = linger;
        self
    }

    pub fn pre_touch_mapped_memory(mut self, enabled: bool) -> Self {
        self.pre_touch_mapped_memory = enabled;
        self
    }

    pub fn use_conductor_agent_invoker(mut self, enabled: bool) -> Self {
        self.use_conductor_agent_invoker = enabled;
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Default for subscriptions added without their own handler.
    pub fn available_image_handler(mut self, handler: AvailableImageHandler) -> Self {
        self.available_image_handler = Some(handler);
        self
    }

    pub fn unavailable_image_handler(mut self, handler: UnavailableImageHandler) -> Self {
        self.unavailable_image_handler = Some(handler);
        self
    }

    pub fn available_counter_handler(mut self, handler: AvailableCounterHandler) -> Self {
        self.available_counter_handler = Some(handler);
        self
    }

    pub fn unavailable_counter_handler(mut self, handler: UnavailableCounterHandler) -> Self {
        self.unavailable_counter_handler = Some(handler);
        self
    }

    pub fn close_handler(mut self, handler: CloseHandler) -> Self {
        self.close_handler = Some(handler);
        self
    }

    /// Replace the shared-memory command path.
    pub fn to_driver(mut self, to_driver: Box<dyn ToDriver>) -> Self {
        self.to_driver = Some(to_driver);
        self
    }

    /// Replace the shared-memory event path.
    pub fn to_clients(mut self, to_clients: Box<dyn ToClients>) -> Self {
        self.to_clients = Some(to_clients);
        self
    }

    pub fn counters_reader(mut self, reader: Arc<CountersReader>) -> Self {
        self.counters_reader = Some(reader);
        self
    }

    pub fn nano_clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.nano_clock = clock;
        self
    }

    pub fn epoch_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.epoch_clock = clock;
        self
    }

    /// How a caller waits between polls while awaiting a driver response.
    pub fn awaiting_idle_strategy(mut self, idle: Box<dyn IdleStrategy>) -> Self {
        self.awaiting_idle_strategy = idle;
        self
    }

    /// Idle strategy of the conductor thread.
    pub fn conductor_idle_strategy(mut self, idle: Box<dyn IdleStrategy>) -> Self {
        self.conductor_idle_strategy = idle;
        self
    }

    /// An embedded driver to run inline while awaiting responses.
    pub fn driver_agent_invoker(mut self, invoker: AgentInvoker) -> Self {
        self.driver_agent_invoker = Some(invoker);
        self
    }

    /// Validate and fill in the shared-memory collaborators for `dir` that
    /// were not supplied.
    pub fn conclude(mut self) -> Result<Self> {
        if self.driver_timeout.is_zero() {
            return Err(Error::InvalidArgument("driver_timeout must be non-zero".into()));
        }
        if self.inter_service_timeout.is_zero() {
            return Err(Error::InvalidArgument("inter_service_timeout must be non-zero".into()));
        }
        if self.keep_alive_interval.is_zero() || self.keep_alive_interval >= self.driver_timeout {
            return Err(Error::InvalidArgument(format!(
                "keep_alive_interval {:?} must be non-zero and below driver_timeout {:?}",
                self.keep_alive_interval, self.driver_timeout
            )));
        }
        if self.dir.is_empty() {
            return Err(Error::InvalidArgument("dir must not be empty".into()));
        }
        if self.client_name.is_empty() {
            self.client_name = "ipcc-client-conductor".to_owned();
        }

        if self.to_driver.is_none() || self.to_clients.is_none() {
            let (to_driver, to_clients) = crate::ipc::connect(&self.dir)?;
            if self.to_driver.is_none() {
                self.to_driver = Some(Box::new(to_driver));
            }
            if self.to_clients.is_none() {
                self.to_clients = Some(Box::new(to_clients));
            }
        }
        if self.counters_reader.is_none() {
            self.counters_reader = Some(Arc::new(CountersReader::open(&self.dir)?));
        }
        if let Some(invoker) = self.driver_agent_invoker.as_mut() {
            invoker.start();
        }
        Ok(self)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dir", &self.dir)
            .field("client_name", &self.client_name)
            .field("driver_timeout", &self.driver_timeout)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("inter_service_timeout", &self.inter_service_timeout)
            .field("resource_linger_duration", &self.resource_linger_duration)
            .field("close_linger_duration", &self.close_linger_duration)
            .field("pre_touch_mapped_memory", &self.pre_touch_mapped_memory)
            .field("use_conductor_agent_invoker", &self.use_conductor_agent_invoker)
            .field("embedded_driver", &self.driver_agent_invoker.is_some())
            .finish()
    }
}
