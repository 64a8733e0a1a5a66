// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The client conductor. Turns driver commands into blocking calls by
// polling the event channel until the matching response arrives, keeps the
// registry of live resources and their log buffers, and runs the periodic
// liveness checks that detect a dead driver or a stalled client.
//
// One client-wide reentrant lock serialises API calls and duty cycles.
// Application callbacks run with the lock held and the in-callback flag
// set; every entry point checks the flag before touching state, so a call
// from inside a callback fails fast instead of deadlocking.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};

use crate::agent::{Agent, AgentInvoker};
use crate::clock::{elapsed_before, EpochClock, NanoClock};
use crate::command::{DriverEvent, DriverProxy, ToClients, NULL_VALUE};
use crate::context::{Context, IDLE_SLEEP};
use crate::counters::{
    self, AtomicCounter, CountersReader, CLIENT_HEARTBEAT_TYPE_ID, MAX_KEY_LENGTH, MAX_LABEL_LENGTH,
    NULL_COUNTER_ID,
};
use crate::error::{Error, ErrorCode, Result};
use crate::handlers::{
    isolate, AvailableCounterHandler, AvailableImageHandler, CloseHandler, ErrorHandler, HandlerId,
    HandlerList, UnavailableCounterHandler, UnavailableImageHandler,
};
use crate::idle::IdleStrategy;
use crate::log_buffers::LogBuffers;
use crate::registry::{AsyncCommandSet, LogBufferCache, ResourceRegistry};
use crate::resource::{Counter, Image, Publication, Resource, Subscription};

/// Correlation id used by the duty cycle, which awaits nothing.
pub const NO_CORRELATION_ID: i64 = NULL_VALUE;

const IDLE_SLEEP_NS: i64 = IDLE_SLEEP.as_nanos() as i64;

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Everything guarded by the client lock.
struct ConductorState {
    driver_proxy: DriverProxy,
    to_clients: Box<dyn ToClients>,
    events: Vec<DriverEvent>,
    registry: ResourceRegistry,
    log_buffers: LogBufferCache,
    async_commands: AsyncCommandSet,
    available_counter_handlers: HandlerList<AvailableCounterHandler>,
    unavailable_counter_handlers: HandlerList<UnavailableCounterHandler>,
    close_handlers: HandlerList<CloseHandler>,
    stashed_channel: Option<String>,
    driver_exception: Option<Error>,
    received_correlation_id: i64,
    heartbeat: Option<AtomicCounter>,
    time_of_last_keepalive_ns: i64,
    time_of_last_service_ns: i64,
    awaiting_idle: Box<dyn IdleStrategy>,
    driver_invoker: Option<AgentInvoker>,
}

pub struct ClientConductor {
    self_ref: Weak<ClientConductor>,
    state: ReentrantMutex<RefCell<ConductorState>>,
    /// Only read or written by the thread holding `state`.
    in_callback: AtomicBool,
    is_closed: AtomicBool,
    is_terminating: AtomicBool,
    interrupted: AtomicBool,
    terminated_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    client_id: i64,
    role_name: String,
    error_handler: ErrorHandler,
    counters: Arc<CountersReader>,
    nano_clock: Arc<dyn NanoClock>,
    epoch_clock: Arc<dyn EpochClock>,
    default_available_image_handler: Option<AvailableImageHandler>,
    default_unavailable_image_handler: Option<UnavailableImageHandler>,
    driver_timeout_ns: i64,
    driver_timeout_ms: i64,
    keep_alive_interval_ns: i64,
    inter_service_timeout_ns: i64,
    resource_linger_ns: i64,
    close_linger: Duration,
    pre_touch: bool,
}

impl ClientConductor {
    /// Build a conductor from a concluded context. Fails if the transports
    /// or counters were never filled in.
    pub fn new(mut ctx: Context) -> Result<Arc<Self>> {
        let not_concluded = || Error::InvalidArgument("context has not been concluded".into());
        let to_driver = ctx.to_driver.take().ok_or_else(not_concluded)?;
        let to_clients = ctx.to_clients.take().ok_or_else(not_concluded)?;
        let counters = ctx.counters_reader.take().ok_or_else(not_concluded)?;

        let driver_proxy = DriverProxy::new(to_driver);
        let client_id = driver_proxy.client_id();

        let mut available_counter_handlers = HandlerList::new();
        if let Some(h) = ctx.available_counter_handler.take() {
            available_counter_handlers.add(h);
        }
        let mut unavailable_counter_handlers = HandlerList::new();
        if let Some(h) = ctx.unavailable_counter_handler.take() {
            unavailable_counter_handlers.add(h);
        }
        let mut close_handlers = HandlerList::new();
        if let Some(h) = ctx.close_handler.take() {
            close_handlers.add(h);
        }

        let now_ns = ctx.nano_clock.nano_time();
        let awaiting_idle = std::mem::replace(
            &mut ctx.awaiting_idle_strategy,
            Box::new(crate::idle::NoOpIdleStrategy),
        );

        let state = ConductorState {
            driver_proxy,
            to_clients,
            events: Vec::new(),
            registry: ResourceRegistry::new(),
            log_buffers: LogBufferCache::new(),
            async_commands: AsyncCommandSet::new(),
            available_counter_handlers,
            unavailable_counter_handlers,
            close_handlers,
            stashed_channel: None,
            driver_exception: None,
            received_correlation_id: NULL_VALUE,
            heartbeat: None,
            time_of_last_keepalive_ns: now_ns,
            time_of_last_service_ns: now_ns,
            awaiting_idle,
            driver_invoker: ctx.driver_agent_invoker.take(),
        };

        tracing::info!(client_id, dir = %ctx.dir, name = %ctx.client_name, "client conductor started");

        Ok(Arc::new_cyclic(|self_ref| ClientConductor {
            self_ref: self_ref.clone(),
            state: ReentrantMutex::new(RefCell::new(state)),
            in_callback: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            is_terminating: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            terminated_hook: Mutex::new(None),
            client_id,
            role_name: ctx.client_name.clone(),
            error_handler: ctx.error_handler.clone(),
            counters,
            nano_clock: Arc::clone(&ctx.nano_clock),
            epoch_clock: Arc::clone(&ctx.epoch_clock),
            default_available_image_handler: ctx.available_image_handler.take(),
            default_unavailable_image_handler: ctx.unavailable_image_handler.take(),
            driver_timeout_ns: nanos(ctx.driver_timeout),
            driver_timeout_ms: millis(ctx.driver_timeout),
            keep_alive_interval_ns: nanos(ctx.keep_alive_interval),
            inter_service_timeout_ns: nanos(ctx.inter_service_timeout),
            resource_linger_ns: nanos(ctx.resource_linger_duration),
            close_linger: ctx.close_linger_duration,
            pre_touch: ctx.pre_touch_mapped_memory,
        }))
    }

    // -----------------------------------------------------------------------
    // Lifecycle queries (lock-free)
    // -----------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn is_terminating(&self) -> bool {
        self.is_terminating.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn counters_reader(&self) -> &Arc<CountersReader> {
        &self.counters
    }

    /// Make the call currently awaiting a driver response (or the next one)
    /// fail with `Interrupted`, leaving the conductor Terminating.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Status of a channel endpoint by its status indicator id.
    pub fn channel_status(&self, channel_status_id: i32) -> i64 {
        counters::channel_status(&self.counters, channel_status_id)
    }

    pub(crate) fn set_terminated_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.terminated_hook.lock() = Some(hook);
    }

    // -----------------------------------------------------------------------
    // Guards and callback isolation
    // -----------------------------------------------------------------------

    fn ensure_active(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        if self.is_terminating() {
            return Err(Error::ClientTerminating);
        }
        Ok(())
    }

    fn ensure_not_reentrant(&self) -> Result<()> {
        if self.in_callback.load(Ordering::Relaxed) {
            return Err(Error::ReentrantCall);
        }
        Ok(())
    }

    /// Lock, check the client is usable, and run `f` over the state.
    fn with_active<R>(&self, f: impl FnOnce(&mut ConductorState) -> Result<R>) -> Result<R> {
        let guard = self.state.lock();
        self.ensure_not_reentrant()?;
        self.ensure_active()?;
        let mut st = guard.try_borrow_mut().map_err(|_| Error::ReentrantCall)?;
        f(&mut st)
    }

    fn handle_error(&self, error: &Error) {
        let prev = self.in_callback.swap(true, Ordering::Relaxed);
        if isolate(|| (self.error_handler)(error)).is_err() {
            tracing::error!(error = %error, "error handler panicked");
        }
        self.in_callback.store(prev, Ordering::Relaxed);
    }

    /// Run application code with the reentrancy flag set. A panic is
    /// reported to the error handler and goes no further.
    fn invoke_callback(&self, f: impl FnOnce()) {
        let prev = self.in_callback.swap(true, Ordering::Relaxed);
        if let Err(e) = isolate(f) {
            self.handle_error(&e);
        }
        self.in_callback.store(prev, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Publications
    // -----------------------------------------------------------------------

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<Publication>> {
        self.with_active(|st| {
            st.stashed_channel = Some(channel.to_owned());
            let correlation_id = st.driver_proxy.add_publication(channel, stream_id)?;
            self.await_response(st, correlation_id)?;
            Self::registered_publication(st, correlation_id)
        })
    }

    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<Publication>> {
        self.with_active(|st| {
            st.stashed_channel = Some(channel.to_owned());
            let correlation_id = st.driver_proxy.add_exclusive_publication(channel, stream_id)?;
            self.await_response(st, correlation_id)?;
            Self::registered_publication(st, correlation_id)
        })
    }

    fn registered_publication(st: &ConductorState, correlation_id: i64) -> Result<Arc<Publication>> {
        match st.registry.lookup(correlation_id) {
            Some(Resource::Publication(p)) => Ok(Arc::clone(p)),
            _ => Err(Error::registration(
                correlation_id,
                ErrorCode::GenericError.code(),
                "no publication registered for response",
            )),
        }
    }

    pub(crate) fn release_publication(&self, publication: &Publication) -> Result<()> {
        if publication.is_closed() {
            return Ok(());
        }
        self.with_active(|st| {
            if !publication.internal_close() {
                return Ok(());
            }
            let registration_id = publication.registration_id();
            match st.registry.unregister(registration_id) {
                Some(Resource::Publication(p)) if std::ptr::eq(Arc::as_ptr(&p), publication) => {
                    let now_ns = self.nano_clock.nano_time();
                    st.log_buffers
                        .release(&p.log_buffers, p.original_registration_id, now_ns);
                    tracing::debug!(registration_id, "releasing publication");
                    let correlation_id = st.driver_proxy.remove_publication(registration_id)?;
                    self.await_response(st, correlation_id)
                }
                Some(other) => {
                    st.registry.register(registration_id, other);
                    Ok(())
                }
                None => Ok(()),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe using the context's default image handlers.
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<Arc<Subscription>> {
        self.add_subscription_with_handlers(
            channel,
            stream_id,
            self.default_available_image_handler.clone(),
            self.default_unavailable_image_handler.clone(),
        )
    }

    pub fn add_subscription_with_handlers(
        &self,
        channel: &str,
        stream_id: i32,
        available_image_handler: Option<AvailableImageHandler>,
        unavailable_image_handler: Option<UnavailableImageHandler>,
    ) -> Result<Arc<Subscription>> {
        self.with_active(|st| {
            let correlation_id = st.driver_proxy.add_subscription(channel, stream_id)?;
            let subscription = Arc::new(Subscription::new(
                self.self_ref.clone(),
                Arc::clone(&self.counters),
                channel,
                stream_id,
                correlation_id,
                available_image_handler,
                unavailable_image_handler,
            ));
            // Registered before the reply: images may arrive in the same batch.
            st.registry
                .register(correlation_id, Resource::Subscription(Arc::clone(&subscription)));

            if let Err(e) = self.await_response(st, correlation_id) {
                if let Some(Resource::Subscription(s)) = st.registry.unregister(correlation_id) {
                    s.internal_close();
                }
                return Err(e);
            }
            Ok(subscription)
        })
    }

    pub(crate) fn release_subscription(&self, subscription: &Subscription) -> Result<()> {
        if subscription.is_closed() {
            return Ok(());
        }
        self.with_active(|st| {
            if subscription.is_closed() {
                return Ok(());
            }
            let images = subscription.internal_close();
            self.close_images(st, images, subscription.unavailable_image_handler.clone());
            let registration_id = subscription.registration_id();
            st.registry.unregister(registration_id);
            tracing::debug!(registration_id, "releasing subscription");
            let correlation_id = st.driver_proxy.remove_subscription(registration_id)?;
            self.await_response(st, correlation_id)
        })
    }

    // -----------------------------------------------------------------------
    // Destinations
    // -----------------------------------------------------------------------

    pub fn add_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<()> {
        self.with_active(|st| {
            let correlation_id = st.driver_proxy.add_destination(registration_id, endpoint_channel)?;
            self.await_response(st, correlation_id)
        })
    }

    pub fn remove_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<()> {
        self.with_active(|st| {
            let correlation_id = st
                .driver_proxy
                .remove_destination(registration_id, endpoint_channel)?;
            self.await_response(st, correlation_id)
        })
    }

    pub fn add_rcv_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<()> {
        self.with_active(|st| {
            let correlation_id = st
                .driver_proxy
                .add_rcv_destination(registration_id, endpoint_channel)?;
            self.await_response(st, correlation_id)
        })
    }

    pub fn remove_rcv_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<()> {
        self.with_active(|st| {
            let correlation_id = st
                .driver_proxy
                .remove_rcv_destination(registration_id, endpoint_channel)?;
            self.await_response(st, correlation_id)
        })
    }

    /// Send without waiting. The returned correlation id stays active in
    /// [`ClientConductor::is_command_active`] until the driver answers.
    pub fn async_add_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<i64> {
        self.with_active(|st| {
            let correlation_id = st.driver_proxy.add_destination(registration_id, endpoint_channel)?;
            st.async_commands.insert(correlation_id);
            Ok(correlation_id)
        })
    }

    pub fn async_remove_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<i64> {
        self.with_active(|st| {
            let correlation_id = st
                .driver_proxy
                .remove_destination(registration_id, endpoint_channel)?;
            st.async_commands.insert(correlation_id);
            Ok(correlation_id)
        })
    }

    pub fn async_add_rcv_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<i64> {
        self.with_active(|st| {
            let correlation_id = st
                .driver_proxy
                .add_rcv_destination(registration_id, endpoint_channel)?;
            st.async_commands.insert(correlation_id);
            Ok(correlation_id)
        })
    }

    pub fn async_remove_rcv_destination(&self, registration_id: i64, endpoint_channel: &str) -> Result<i64> {
        self.with_active(|st| {
            let correlation_id = st
                .driver_proxy
                .remove_rcv_destination(registration_id, endpoint_channel)?;
            st.async_commands.insert(correlation_id);
            Ok(correlation_id)
        })
    }

    pub fn is_command_active(&self, correlation_id: i64) -> Result<bool> {
        self.with_active(|st| Ok(st.async_commands.contains(correlation_id)))
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Ask the driver for a counter with the given key and label.
    pub fn add_counter(&self, type_id: i32, key: &[u8], label: &str) -> Result<Arc<Counter>> {
        self.with_active(|st| {
            if key.len() > MAX_KEY_LENGTH {
                return Err(Error::InvalidArgument(format!(
                    "key length out of bounds: {}",
                    key.len()
                )));
            }
            if label.len() > MAX_LABEL_LENGTH {
                return Err(Error::InvalidArgument(format!(
                    "label length out of bounds: {}",
                    label.len()
                )));
            }
            let correlation_id = st.driver_proxy.add_counter(type_id, key, label)?;
            self.await_response(st, correlation_id)?;
            match st.registry.lookup(correlation_id) {
                Some(Resource::Counter(c)) => Ok(Arc::clone(c)),
                _ => Err(Error::registration(
                    correlation_id,
                    ErrorCode::GenericError.code(),
                    "no counter registered for response",
                )),
            }
        })
    }

    pub fn add_counter_with_label(&self, type_id: i32, label: &str) -> Result<Arc<Counter>> {
        self.add_counter(type_id, &[], label)
    }

    pub(crate) fn release_counter(&self, counter: &Counter) -> Result<()> {
        self.with_active(|st| {
            let registration_id = counter.registration_id();
            if st.registry.unregister(registration_id).is_none() {
                return Ok(());
            }
            counter.internal_close();
            tracing::debug!(registration_id, counter_id = counter.id(), "releasing counter");
            let correlation_id = st.driver_proxy.remove_counter(registration_id)?;
            self.await_response(st, correlation_id)
        })
    }

    // -----------------------------------------------------------------------
    // Handler registries
    // -----------------------------------------------------------------------

    pub fn add_available_counter_handler(&self, handler: AvailableCounterHandler) -> Result<HandlerId> {
        self.with_active(|st| Ok(st.available_counter_handlers.add(handler)))
    }

    pub fn remove_available_counter_handler(&self, id: HandlerId) -> Result<bool> {
        self.with_active(|st| Ok(st.available_counter_handlers.remove(id)))
    }

    pub fn add_unavailable_counter_handler(&self, handler: UnavailableCounterHandler) -> Result<HandlerId> {
        self.with_active(|st| Ok(st.unavailable_counter_handlers.add(handler)))
    }

    pub fn remove_unavailable_counter_handler(&self, id: HandlerId) -> Result<bool> {
        self.with_active(|st| Ok(st.unavailable_counter_handlers.remove(id)))
    }

    /// Close handlers run in reverse order of registration.
    pub fn add_close_handler(&self, handler: CloseHandler) -> Result<HandlerId> {
        self.with_active(|st| Ok(st.close_handlers.add(handler)))
    }

    pub fn remove_close_handler(&self, id: HandlerId) -> Result<bool> {
        self.with_active(|st| Ok(st.close_handlers.remove(id)))
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    fn inspect<R>(&self, default: R, f: impl FnOnce(&ConductorState) -> R) -> R {
        self.state.lock().try_borrow().map(|st| f(&st)).unwrap_or(default)
    }

    /// Number of publications, subscriptions and counters registered.
    pub fn resource_count(&self) -> usize {
        self.inspect(0, |st| st.registry.len())
    }

    pub fn is_registered(&self, registration_id: i64) -> bool {
        self.inspect(false, |st| st.registry.contains(registration_id))
    }

    /// Buffers released to zero references and not yet unmapped.
    pub fn lingering_log_buffers(&self) -> Vec<Arc<LogBuffers>> {
        self.inspect(Vec::new(), |st| st.log_buffers.lingering().to_vec())
    }

    // -----------------------------------------------------------------------
    // Duty cycle
    // -----------------------------------------------------------------------

    /// One non-blocking duty cycle. Skips the cycle if another thread holds
    /// the lock. Fails with `AgentTermination` once Terminating or closed.
    pub fn do_work(&self) -> Result<usize> {
        let Some(guard) = self.state.try_lock() else {
            return Ok(0);
        };
        if self.in_callback.load(Ordering::Relaxed) {
            return Ok(0);
        }
        if self.is_terminating() || self.is_closed() {
            return Err(Error::AgentTermination);
        }
        let Ok(mut st) = guard.try_borrow_mut() else {
            return Ok(0);
        };
        self.service(&mut st, NO_CORRELATION_ID)
    }

    /// Liveness checks plus event dispatch. Errors go to the error handler;
    /// an API call awaiting `correlation_id` also gets them back.
    fn service(&self, st: &mut ConductorState, correlation_id: i64) -> Result<usize> {
        let result = match self.check_timeouts(st) {
            Ok(work) => self.receive(st, correlation_id).map(|n| n + work),
            Err(e) => Err(e),
        };
        match result {
            Ok(work) => Ok(work),
            Err(e) => {
                self.handle_error(&e);
                if st.to_clients.is_invalid() {
                    tracing::warn!(client_id = self.client_id, "event channel invalid, closing");
                    self.close_locked(st);
                }
                if correlation_id != NO_CORRELATION_ID {
                    Err(e)
                } else {
                    Ok(0)
                }
            }
        }
    }

    fn await_response(&self, st: &mut ConductorState, correlation_id: i64) -> Result<()> {
        let deadline_ns = self.nano_clock.nano_time().saturating_add(self.driver_timeout_ns);
        st.awaiting_idle.reset();
        loop {
            match st.driver_invoker.as_mut() {
                Some(invoker) => {
                    invoker.invoke();
                }
                None => st.awaiting_idle.idle(),
            }

            self.service(st, correlation_id)?;

            if st.received_correlation_id == correlation_id {
                return match st.driver_exception.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }

            if self.is_terminating() {
                return Err(Error::ClientTerminating);
            }

            if self.interrupted.swap(false, Ordering::AcqRel) {
                self.is_terminating.store(true, Ordering::Release);
                tracing::warn!(correlation_id, "interrupted while awaiting driver response");
                return Err(Error::Interrupted);
            }

            if deadline_ns.saturating_sub(self.nano_clock.nano_time()) <= 0 {
                break;
            }
        }
        Err(Error::DriverTimeout(format!(
            "no response from driver within (ns): {}",
            self.driver_timeout_ns
        )))
    }

    // -----------------------------------------------------------------------
    // Liveness and reclamation
    // -----------------------------------------------------------------------

    fn check_timeouts(&self, st: &mut ConductorState) -> Result<usize> {
        let now_ns = self.nano_clock.nano_time();
        if elapsed_before(st.time_of_last_service_ns, IDLE_SLEEP_NS, now_ns) {
            return Ok(0);
        }
        self.check_service_interval(st, now_ns)?;
        st.time_of_last_service_ns = now_ns;

        let mut work = self.check_liveness(st, now_ns)?;
        work += st.log_buffers.sweep(now_ns, self.resource_linger_ns);
        Ok(work)
    }

    fn check_service_interval(&self, st: &mut ConductorState, now_ns: i64) -> Result<()> {
        if !elapsed_before(st.time_of_last_service_ns, self.inter_service_timeout_ns, now_ns) {
            self.is_terminating.store(true, Ordering::Release);
            self.force_close_resources(st);
            return Err(Error::ServiceTimeout {
                timeout_ns: self.inter_service_timeout_ns,
                actual_ns: now_ns - st.time_of_last_service_ns,
            });
        }
        Ok(())
    }

    fn check_liveness(&self, st: &mut ConductorState, now_ns: i64) -> Result<usize> {
        if elapsed_before(st.time_of_last_keepalive_ns, self.keep_alive_interval_ns, now_ns) {
            return Ok(0);
        }

        let last_keepalive_ms = st.driver_proxy.time_of_last_driver_keepalive_ms();
        let now_ms = self.epoch_clock.time();
        if now_ms > last_keepalive_ms.saturating_add(self.driver_timeout_ms) {
            self.is_terminating.store(true, Ordering::Release);
            self.force_close_resources(st);
            return Err(Error::DriverTimeout(format!(
                "driver keepalive age exceeded (ms): timeout={}, actual={}",
                self.driver_timeout_ms,
                now_ms.saturating_sub(last_keepalive_ms)
            )));
        }

        match st.heartbeat.as_ref().map(AtomicCounter::id) {
            None => {
                let counter_id =
                    counters::find_heartbeat_counter_id(&self.counters, CLIENT_HEARTBEAT_TYPE_ID, self.client_id);
                if counter_id != NULL_COUNTER_ID {
                    if let Some(heartbeat) = AtomicCounter::new(Arc::clone(&self.counters), counter_id) {
                        tracing::debug!(counter_id, client_id = self.client_id, "found heartbeat counter");
                        heartbeat.set_ordered(now_ms);
                        st.heartbeat = Some(heartbeat);
                        st.time_of_last_keepalive_ns = now_ns;
                    }
                }
            }
            Some(counter_id) => {
                if !counters::is_heartbeat_active(
                    &self.counters,
                    counter_id,
                    CLIENT_HEARTBEAT_TYPE_ID,
                    self.client_id,
                ) {
                    self.is_terminating.store(true, Ordering::Release);
                    self.force_close_resources(st);
                    return Err(Error::HeartbeatCounterClosed { counter_id });
                }
                if let Some(heartbeat) = st.heartbeat.as_ref() {
                    heartbeat.set_ordered(now_ms);
                }
                st.time_of_last_keepalive_ns = now_ns;
            }
        }
        Ok(1)
    }

    /// Close every registered resource without telling the driver.
    fn force_close_resources(&self, st: &mut ConductorState) {
        let resources = st.registry.drain();
        if !resources.is_empty() {
            tracing::warn!(count = resources.len(), "force closing resources");
        }
        for (_, resource) in resources {
            match resource {
                Resource::Subscription(s) => {
                    let images = s.internal_close();
                    self.close_images(st, images, s.unavailable_image_handler.clone());
                }
                Resource::Publication(p) => {
                    p.internal_close();
                    let now_ns = self.nano_clock.nano_time();
                    st.log_buffers
                        .release(&p.log_buffers, p.original_registration_id, now_ns);
                }
                Resource::Counter(c) => {
                    c.internal_close();
                    self.on_unavailable_counter(st, c.registration_id(), c.id());
                }
            }
        }
    }

    /// Release the images' log buffers, then tell the handler about each.
    fn close_images(
        &self,
        st: &mut ConductorState,
        images: Vec<Arc<Image>>,
        handler: Option<UnavailableImageHandler>,
    ) {
        let now_ns = self.nano_clock.nano_time();
        for image in &images {
            st.log_buffers
                .release(&image.log_buffers, image.correlation_id, now_ns);
        }
        if let Some(handler) = handler {
            for image in &images {
                self.invoke_callback(|| handler(image));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    fn receive(&self, st: &mut ConductorState, active_correlation_id: i64) -> Result<usize> {
        st.received_correlation_id = NULL_VALUE;
        let mut events = std::mem::take(&mut st.events);
        events.clear();
        let received = st.to_clients.receive(&mut events);
        let count = match received {
            Ok(count) => count,
            Err(e) => {
                st.events = events;
                return Err(e);
            }
        };
        for event in events.drain(..) {
            self.dispatch(st, event, active_correlation_id);
        }
        st.events = events;
        Ok(count)
    }

    fn dispatch(&self, st: &mut ConductorState, event: DriverEvent, active_correlation_id: i64) {
        match event {
            DriverEvent::Error {
                correlation_id,
                code,
                message,
            } => {
                if correlation_id == active_correlation_id {
                    st.received_correlation_id = correlation_id;
                    self.on_error(st, correlation_id, code, message);
                } else if st.async_commands.remove(correlation_id) {
                    self.handle_error(&Error::registration(correlation_id, code, message));
                }
            }
            DriverEvent::PublicationReady {
                correlation_id,
                registration_id,
                stream_id,
                session_id,
                publication_limit_id,
                channel_status_id,
                log_file_name,
                exclusive,
            } => {
                if correlation_id == active_correlation_id {
                    st.received_correlation_id = correlation_id;
                    self.on_new_publication(
                        st,
                        correlation_id,
                        registration_id,
                        stream_id,
                        session_id,
                        publication_limit_id,
                        channel_status_id,
                        &log_file_name,
                        exclusive,
                    );
                }
            }
            DriverEvent::SubscriptionReady {
                correlation_id,
                channel_status_id,
            } => {
                if correlation_id == active_correlation_id {
                    st.received_correlation_id = correlation_id;
                    if let Some(Resource::Subscription(s)) = st.registry.lookup(correlation_id) {
                        s.set_channel_status_id(channel_status_id);
                    }
                }
            }
            DriverEvent::OperationSuccess { correlation_id } => {
                st.async_commands.remove(correlation_id);
                if correlation_id == active_correlation_id {
                    st.received_correlation_id = correlation_id;
                }
            }
            DriverEvent::AvailableImage {
                correlation_id,
                session_id,
                subscription_registration_id,
                subscriber_position_id,
                log_file_name,
                source_identity,
            } => self.on_available_image(
                st,
                correlation_id,
                session_id,
                subscription_registration_id,
                subscriber_position_id,
                &log_file_name,
                source_identity,
            ),
            DriverEvent::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                ..
            } => self.on_unavailable_image(st, correlation_id, subscription_registration_id),
            DriverEvent::CounterReady {
                correlation_id,
                counter_id,
            } => {
                if correlation_id == active_correlation_id {
                    st.received_correlation_id = correlation_id;
                    self.on_new_counter(st, correlation_id, counter_id);
                } else {
                    self.on_available_counter(st, correlation_id, counter_id);
                }
            }
            DriverEvent::UnavailableCounter {
                registration_id,
                counter_id,
            } => self.on_unavailable_counter(st, registration_id, counter_id),
            DriverEvent::ChannelEndpointError {
                status_indicator_id,
                message,
            } => self.on_channel_endpoint_error(st, status_indicator_id, &message),
            DriverEvent::ClientTimeout { client_id } => {
                if client_id == self.client_id {
                    self.on_client_timeout(st);
                }
            }
            DriverEvent::Unknown { type_id } => {
                tracing::trace!(type_id, "ignoring unknown driver event");
            }
        }
    }

    fn on_error(&self, st: &mut ConductorState, correlation_id: i64, code: i32, message: String) {
        tracing::debug!(correlation_id, code, reason = %message, "driver rejected command");
        st.driver_exception = Some(Error::registration(correlation_id, code, message));
        if matches!(st.registry.lookup(correlation_id), Some(Resource::Subscription(_))) {
            if let Some(Resource::Subscription(s)) = st.registry.unregister(correlation_id) {
                s.internal_close();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_new_publication(
        &self,
        st: &mut ConductorState,
        correlation_id: i64,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        publication_limit_id: i32,
        channel_status_id: i32,
        log_file_name: &str,
        exclusive: bool,
    ) {
        let channel = st.stashed_channel.take().unwrap_or_default();
        let log_buffers = match st
            .log_buffers
            .acquire(registration_id, log_file_name, &channel, self.pre_touch)
        {
            Ok(buffers) => buffers,
            Err(e) => {
                st.driver_exception = Some(Error::Io(e));
                return;
            }
        };
        tracing::debug!(
            correlation_id,
            registration_id,
            session_id,
            file_name = log_file_name,
            exclusive,
            "publication ready"
        );
        let publication = Arc::new(Publication {
            conductor: self.self_ref.clone(),
            counters: Arc::clone(&self.counters),
            channel,
            stream_id,
            session_id,
            registration_id: correlation_id,
            original_registration_id: registration_id,
            publication_limit_id,
            channel_status_id,
            exclusive,
            log_buffers,
            closed: AtomicBool::new(false),
        });
        st.registry
            .register(correlation_id, Resource::Publication(publication));
    }

    #[allow(clippy::too_many_arguments)]
    fn on_available_image(
        &self,
        st: &mut ConductorState,
        correlation_id: i64,
        session_id: i32,
        subscription_registration_id: i64,
        subscriber_position_id: i32,
        log_file_name: &str,
        source_identity: String,
    ) {
        let subscription = match st.registry.lookup(subscription_registration_id) {
            Some(Resource::Subscription(s)) => Arc::clone(s),
            _ => return,
        };
        let log_buffers = match st.log_buffers.acquire(
            correlation_id,
            log_file_name,
            subscription.channel(),
            self.pre_touch,
        ) {
            Ok(buffers) => buffers,
            Err(e) => {
                self.handle_error(&Error::Io(e));
                return;
            }
        };
        tracing::debug!(
            correlation_id,
            session_id,
            subscription_registration_id,
            file_name = log_file_name,
            "image available"
        );
        let image = Arc::new(Image {
            counters: Arc::clone(&self.counters),
            session_id,
            correlation_id,
            subscription_registration_id,
            subscriber_position_id,
            source_identity,
            log_buffers,
            closed: AtomicBool::new(false),
        });
        if let Some(handler) = subscription.available_image_handler.as_ref() {
            self.invoke_callback(|| handler(&image));
        }
        subscription.add_image(image);
    }

    fn on_unavailable_image(&self, st: &mut ConductorState, correlation_id: i64, subscription_registration_id: i64) {
        let subscription = match st.registry.lookup(subscription_registration_id) {
            Some(Resource::Subscription(s)) => Arc::clone(s),
            _ => return,
        };
        let Some(image) = subscription.remove_image(correlation_id) else {
            return;
        };
        tracing::debug!(correlation_id, subscription_registration_id, "image unavailable");
        let now_ns = self.nano_clock.nano_time();
        st.log_buffers
            .release(&image.log_buffers, correlation_id, now_ns);
        if let Some(handler) = subscription.unavailable_image_handler.as_ref() {
            self.invoke_callback(|| handler(&image));
        }
    }

    fn on_new_counter(&self, st: &mut ConductorState, correlation_id: i64, counter_id: i32) {
        let Some(counter) = AtomicCounter::new(Arc::clone(&self.counters), counter_id) else {
            st.driver_exception = Some(Error::InvalidArgument(format!(
                "counter id {counter_id} outside counters region"
            )));
            return;
        };
        tracing::debug!(correlation_id, counter_id, "counter ready");
        st.registry.register(
            correlation_id,
            Resource::Counter(Arc::new(Counter {
                conductor: self.self_ref.clone(),
                registration_id: correlation_id,
                counter,
                closed: AtomicBool::new(false),
            })),
        );
        self.on_available_counter(st, correlation_id, counter_id);
    }

    fn on_available_counter(&self, st: &mut ConductorState, registration_id: i64, counter_id: i32) {
        for handler in st.available_counter_handlers.snapshot() {
            self.invoke_callback(|| handler(&self.counters, registration_id, counter_id));
        }
    }

    fn on_unavailable_counter(&self, st: &mut ConductorState, registration_id: i64, counter_id: i32) {
        for handler in st.unavailable_counter_handlers.snapshot() {
            self.invoke_callback(|| handler(&self.counters, registration_id, counter_id));
        }
    }

    fn on_channel_endpoint_error(&self, st: &mut ConductorState, status_indicator_id: i32, message: &str) {
        for id in st.registry.ids_with_channel_status(status_indicator_id) {
            let Some(resource) = st.registry.unregister(id) else {
                continue;
            };
            tracing::warn!(registration_id = id, status_indicator_id, reason = message, "channel endpoint error");
            self.handle_error(&Error::ChannelEndpoint {
                status_indicator_id,
                message: message.to_owned(),
            });
            match resource {
                Resource::Subscription(s) => {
                    let images = s.internal_close();
                    self.close_images(st, images, s.unavailable_image_handler.clone());
                }
                Resource::Publication(p) => {
                    p.internal_close();
                    let now_ns = self.nano_clock.nano_time();
                    st.log_buffers
                        .release(&p.log_buffers, p.original_registration_id, now_ns);
                }
                Resource::Counter(c) => {
                    // Counters carry no status indicator; never matched.
                    st.registry.register(id, Resource::Counter(c));
                }
            }
        }
    }

    fn on_client_timeout(&self, st: &mut ConductorState) {
        if self.is_closed() {
            return;
        }
        tracing::warn!(client_id = self.client_id, "driver timed out this client");
        self.is_terminating.store(true, Ordering::Release);
        self.force_close_resources(st);
        self.handle_error(&Error::ClientTimeout);
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Close the client. Idempotent. Fails only when called from inside a
    /// callback.
    pub fn close(&self) -> Result<()> {
        let guard = self.state.lock();
        self.ensure_not_reentrant()?;
        let mut st = guard.try_borrow_mut().map_err(|_| Error::ReentrantCall)?;
        self.close_locked(&mut st);
        Ok(())
    }

    fn close_locked(&self, st: &mut ConductorState) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let terminating = self.is_terminating();
        if terminating {
            let hook = self.terminated_hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }

        self.force_close_resources(st);

        for handler in st.close_handlers.snapshot().into_iter().rev() {
            self.invoke_callback(|| handler());
        }

        let mut linger = self.close_linger;
        if terminating {
            linger = linger.saturating_add(IDLE_SLEEP);
        }
        if !linger.is_zero() {
            std::thread::sleep(linger);
        }

        st.log_buffers.delete_all_lingering();

        if let Err(e) = st.driver_proxy.client_close() {
            self.handle_error(&e);
        }
        if let Some(invoker) = st.driver_invoker.as_mut() {
            invoker.close();
        }
        tracing::info!(client_id = self.client_id, terminating, "client conductor closed");
    }
}

impl std::fmt::Debug for ClientConductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConductor")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

/// Runs a conductor's duty cycle under an agent runner or invoker.
pub struct ConductorAgent {
    conductor: Arc<ClientConductor>,
}

impl ConductorAgent {
    pub fn new(conductor: Arc<ClientConductor>) -> Self {
        Self { conductor }
    }
}

impl Agent for ConductorAgent {
    fn do_work(&mut self) -> Result<usize> {
        self.conductor.do_work()
    }

    fn on_close(&mut self) {
        if let Err(e) = self.conductor.close() {
            tracing::warn!(error = %e, "conductor close from agent failed");
        }
    }

    fn role_name(&self) -> &str {
        self.conductor.role_name()
    }
}
