// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Duty-cycle agents. An agent does a bounded, non-blocking slice of work per
// call; either an AgentRunner owns a thread and loops over it, or an
// AgentInvoker lets some other loop drive it inline.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::handlers::{isolate, panic_message, ErrorHandler};
use crate::idle::IdleStrategy;

/// Hand `error` to the application's handler. A panicking handler is logged
/// and goes no further.
fn report(error_handler: &ErrorHandler, error: &Error) {
    if isolate(|| error_handler(error)).is_err() {
        tracing::error!(error = %error, "error handler panicked");
    }
}

pub trait Agent: Send {
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// One duty cycle. Returns the amount of work done; 0 lets the caller idle.
    /// `Err(Error::AgentTermination)` asks the driving loop to stop.
    fn do_work(&mut self) -> Result<usize>;

    fn on_close(&mut self) {}

    fn role_name(&self) -> &str;
}

/// Drives an agent from the caller's own loop.
pub struct AgentInvoker {
    agent: Box<dyn Agent>,
    error_handler: ErrorHandler,
    is_started: bool,
    is_running: bool,
    is_closed: bool,
}

impl AgentInvoker {
    pub fn new(agent: Box<dyn Agent>, error_handler: ErrorHandler) -> Self {
        Self {
            agent,
            error_handler,
            is_started: false,
            is_running: false,
            is_closed: false,
        }
    }

    pub fn start(&mut self) {
        if self.is_started {
            return;
        }
        self.is_started = true;
        match isolate(|| self.agent.on_start()).and_then(|r| r) {
            Ok(()) => self.is_running = true,
            Err(e) => {
                report(&self.error_handler, &e);
                self.close();
            }
        }
    }

    /// Run one duty cycle if started and not closed. A panicking agent is
    /// reported and closed.
    pub fn invoke(&mut self) -> usize {
        if !self.is_running {
            return 0;
        }
        match isolate(|| self.agent.do_work()) {
            Ok(Ok(work)) => work,
            Ok(Err(Error::AgentTermination)) => {
                self.close();
                0
            }
            Ok(Err(e)) => {
                report(&self.error_handler, &e);
                0
            }
            Err(panic) => {
                report(&self.error_handler, &panic);
                self.close();
                0
            }
        }
    }

    pub fn close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        self.is_running = false;
        if let Err(e) = isolate(|| self.agent.on_close()) {
            report(&self.error_handler, &e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn role_name(&self) -> &str {
        self.agent.role_name()
    }
}

/// Owns a thread that loops `do_work` + idle until closed or terminated.
pub struct AgentRunner {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    role_name: String,
    error_handler: ErrorHandler,
}

impl AgentRunner {
    pub fn start<A, I>(mut agent: A, mut idle: I, error_handler: ErrorHandler) -> io::Result<Self>
    where
        A: Agent + 'static,
        I: IdleStrategy + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let role_name = agent.role_name().to_owned();
        let flag = Arc::clone(&running);

        let handler = Arc::clone(&error_handler);

        let thread = std::thread::Builder::new()
            .name(role_name.clone())
            .spawn(move || {
                if let Err(e) = isolate(|| agent.on_start()).and_then(|r| r) {
                    report(&handler, &e);
                    flag.store(false, Ordering::Release);
                }
                while flag.load(Ordering::Acquire) {
                    match isolate(|| agent.do_work()) {
                        Ok(Ok(work)) => idle.idle_work(work),
                        Ok(Err(Error::AgentTermination)) => break,
                        Ok(Err(e)) => {
                            report(&handler, &e);
                            idle.idle();
                        }
                        Err(panic) => {
                            tracing::error!(role = agent.role_name(), error = %panic, "agent panicked");
                            report(&handler, &panic);
                            break;
                        }
                    }
                }
                flag.store(false, Ordering::Release);
                if let Err(e) = isolate(|| agent.on_close()) {
                    report(&handler, &e);
                }
                tracing::debug!(role = agent.role_name(), "agent stopped");
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
            role_name,
            error_handler,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    /// Stop the loop and wait for the thread. Idempotent.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // Joining from the agent's own thread would deadlock.
            if thread.thread().id() != std::thread::current().id() {
                if let Err(payload) = thread.join() {
                    report(&self.error_handler, &Error::Callback(panic_message(payload)));
                }
            }
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}
