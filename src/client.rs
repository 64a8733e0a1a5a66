// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Application entry point: connects to the driver, owns the conductor and
// whatever drives its duty cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{AgentInvoker, AgentRunner};
use crate::conductor::{ClientConductor, ConductorAgent};
use crate::context::Context;
use crate::counters::CountersReader;
use crate::error::{Error, Result};
use crate::handlers::{
    AvailableCounterHandler, AvailableImageHandler, CloseHandler, HandlerId, UnavailableCounterHandler,
    UnavailableImageHandler,
};
use crate::idle::NoOpIdleStrategy;
use crate::resource::{Counter, Publication, Subscription};

/// A connected client.
///
/// By default the conductor runs on its own thread. With
/// `use_conductor_agent_invoker` set, the application drives it by calling
/// [`Client::do_work`].
pub struct Client {
    conductor: Arc<ClientConductor>,
    runner: Mutex<Option<AgentRunner>>,
    invoker: Option<Mutex<AgentInvoker>>,
    is_closed: Arc<AtomicBool>,
}

impl Client {
    pub fn connect(ctx: Context) -> Result<Self> {
        let mut ctx = ctx.conclude()?;
        let use_invoker = ctx.use_conductor_agent_invoker;
        let idle = std::mem::replace(&mut ctx.conductor_idle_strategy, Box::new(NoOpIdleStrategy));
        let error_handler = ctx.error_handler.clone();

        let conductor = ClientConductor::new(ctx)?;
        let is_closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&is_closed);
        conductor.set_terminated_hook(Box::new(move || flag.store(true, Ordering::Release)));

        let agent = ConductorAgent::new(Arc::clone(&conductor));
        let (runner, invoker) = if use_invoker {
            let mut invoker = AgentInvoker::new(Box::new(agent), error_handler);
            invoker.start();
            (None, Some(Mutex::new(invoker)))
        } else {
            (Some(AgentRunner::start(agent, idle, error_handler)?), None)
        };

        Ok(Self {
            conductor,
            runner: Mutex::new(runner),
            invoker,
            is_closed,
        })
    }

    pub fn conductor(&self) -> &Arc<ClientConductor> {
        &self.conductor
    }

    pub fn client_id(&self) -> i64 {
        self.conductor.client_id()
    }

    pub fn counters_reader(&self) -> &Arc<CountersReader> {
        self.conductor.counters_reader()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire) || self.conductor.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    /// Run one conductor duty cycle. Only does anything in invoker mode.
    pub fn do_work(&self) -> usize {
        match &self.invoker {
            Some(invoker) => invoker.lock().invoke(),
            None => 0,
        }
    }

    /// Abort the call currently waiting on the driver.
    pub fn interrupt(&self) {
        self.conductor.interrupt();
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<Publication>> {
        self.ensure_open()?;
        self.conductor.add_publication(channel, stream_id)
    }

    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<Publication>> {
        self.ensure_open()?;
        self.conductor.add_exclusive_publication(channel, stream_id)
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<Arc<Subscription>> {
        self.ensure_open()?;
        self.conductor.add_subscription(channel, stream_id)
    }

    pub fn add_subscription_with_handlers(
        &self,
        channel: &str,
        stream_id: i32,
        available_image_handler: AvailableImageHandler,
        unavailable_image_handler: UnavailableImageHandler,
    ) -> Result<Arc<Subscription>> {
        self.ensure_open()?;
        self.conductor.add_subscription_with_handlers(
            channel,
            stream_id,
            Some(available_image_handler),
            Some(unavailable_image_handler),
        )
    }

    pub fn add_counter(&self, type_id: i32, key: &[u8], label: &str) -> Result<Arc<Counter>> {
        self.ensure_open()?;
        self.conductor.add_counter(type_id, key, label)
    }

    pub fn add_counter_with_label(&self, type_id: i32, label: &str) -> Result<Arc<Counter>> {
        self.ensure_open()?;
        self.conductor.add_counter_with_label(type_id, label)
    }

    pub fn is_command_active(&self, correlation_id: i64) -> Result<bool> {
        self.ensure_open()?;
        self.conductor.is_command_active(correlation_id)
    }

    pub fn add_available_counter_handler(&self, handler: AvailableCounterHandler) -> Result<HandlerId> {
        self.conductor.add_available_counter_handler(handler)
    }

    pub fn remove_available_counter_handler(&self, id: HandlerId) -> Result<bool> {
        self.conductor.remove_available_counter_handler(id)
    }

    pub fn add_unavailable_counter_handler(&self, handler: UnavailableCounterHandler) -> Result<HandlerId> {
        self.conductor.add_unavailable_counter_handler(handler)
    }

    pub fn remove_unavailable_counter_handler(&self, id: HandlerId) -> Result<bool> {
        self.conductor.remove_unavailable_counter_handler(id)
    }

    pub fn add_close_handler(&self, handler: CloseHandler) -> Result<HandlerId> {
        self.conductor.add_close_handler(handler)
    }

    pub fn remove_close_handler(&self, id: HandlerId) -> Result<bool> {
        self.conductor.remove_close_handler(id)
    }

    /// Close the conductor, then stop whatever was driving it. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.conductor.close()?;
        self.is_closed.store(true, Ordering::Release);
        if let Some(mut runner) = self.runner.lock().take() {
            runner.close();
        }
        if let Some(invoker) = &self.invoker {
            invoker.lock().close();
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "client close on drop failed");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
