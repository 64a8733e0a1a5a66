// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Handles the application holds for driver-side resources. Each handle
// knows how to release itself through the conductor that created it.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::conductor::ClientConductor;
use crate::counters::{self, channel_status, AtomicCounter, CountersReader};
use crate::error::Result;
use crate::handlers::{AvailableImageHandler, UnavailableImageHandler};
use crate::log_buffers::LogBuffers;

// ---------------------------------------------------------------------------
// Publication
// ---------------------------------------------------------------------------

/// Sending side of a stream. Concurrent and exclusive publications share
/// this type; [`Publication::is_exclusive`] tells them apart.
pub struct Publication {
    pub(crate) conductor: Weak<ClientConductor>,
    pub(crate) counters: Arc<CountersReader>,
    pub(crate) channel: String,
    pub(crate) stream_id: i32,
    pub(crate) session_id: i32,
    pub(crate) registration_id: i64,
    pub(crate) original_registration_id: i64,
    pub(crate) publication_limit_id: i32,
    pub(crate) channel_status_id: i32,
    pub(crate) exclusive: bool,
    pub(crate) log_buffers: Arc<LogBuffers>,
    pub(crate) closed: AtomicBool,
}

impl Publication {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Correlation id of the command that created this handle.
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Registration id of the driver-side publication. Several handles can
    /// share it, and with it the log buffers.
    pub fn original_registration_id(&self) -> i64 {
        self.original_registration_id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn channel_status_id(&self) -> i32 {
        self.channel_status_id
    }

    pub fn channel_status(&self) -> i64 {
        if self.is_closed() {
            return channel_status::NO_ID_ALLOCATED as i64;
        }
        counters::channel_status(&self.counters, self.channel_status_id)
    }

    /// Position up to which the driver lets this publication write.
    pub fn position_limit(&self) -> i64 {
        self.counters.counter_value(self.publication_limit_id)
    }

    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.log_buffers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_destination(&self, endpoint_channel: &str) -> Result<()> {
        self.conductor()?.add_destination(self.registration_id, endpoint_channel)
    }

    pub fn remove_destination(&self, endpoint_channel: &str) -> Result<()> {
        self.conductor()?.remove_destination(self.registration_id, endpoint_channel)
    }

    /// Returns the correlation id to poll with `is_command_active`.
    pub fn async_add_destination(&self, endpoint_channel: &str) -> Result<i64> {
        self.conductor()?.async_add_destination(self.registration_id, endpoint_channel)
    }

    pub fn async_remove_destination(&self, endpoint_channel: &str) -> Result<i64> {
        self.conductor()?.async_remove_destination(self.registration_id, endpoint_channel)
    }

    /// Release the publication. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.conductor.upgrade() {
            Some(conductor) => conductor.release_publication(self),
            None => {
                self.internal_close();
                Ok(())
            }
        }
    }

    fn conductor(&self) -> Result<Arc<ClientConductor>> {
        self.conductor.upgrade().ok_or(crate::error::Error::ClientClosed)
    }

    /// Mark closed; true if this call did it.
    pub(crate) fn internal_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("channel", &self.channel)
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("registration_id", &self.registration_id)
            .field("exclusive", &self.exclusive)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// One publisher's stream as seen by a subscription.
pub struct Image {
    pub(crate) counters: Arc<CountersReader>,
    pub(crate) session_id: i32,
    pub(crate) correlation_id: i64,
    pub(crate) subscription_registration_id: i64,
    pub(crate) subscriber_position_id: i32,
    pub(crate) source_identity: String,
    pub(crate) log_buffers: Arc<LogBuffers>,
    pub(crate) closed: AtomicBool,
}

impl Image {
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn subscription_registration_id(&self) -> i64 {
        self.subscription_registration_id
    }

    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    /// This subscriber's position in the stream.
    pub fn position(&self) -> i64 {
        self.counters.counter_value(self.subscriber_position_id)
    }

    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.log_buffers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("session_id", &self.session_id)
            .field("correlation_id", &self.correlation_id)
            .field("source_identity", &self.source_identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving side of a stream. Registered before the driver answers; the
/// status indicator is filled in when it does.
pub struct Subscription {
    pub(crate) conductor: Weak<ClientConductor>,
    pub(crate) counters: Arc<CountersReader>,
    pub(crate) channel: String,
    pub(crate) stream_id: i32,
    pub(crate) registration_id: i64,
    pub(crate) channel_status_id: AtomicI32,
    pub(crate) images: RwLock<Vec<Arc<Image>>>,
    pub(crate) available_image_handler: Option<AvailableImageHandler>,
    pub(crate) unavailable_image_handler: Option<UnavailableImageHandler>,
    pub(crate) closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        conductor: Weak<ClientConductor>,
        counters: Arc<CountersReader>,
        channel: &str,
        stream_id: i32,
        registration_id: i64,
        available_image_handler: Option<AvailableImageHandler>,
        unavailable_image_handler: Option<UnavailableImageHandler>,
    ) -> Self {
        Self {
            conductor,
            counters,
            channel: channel.to_owned(),
            stream_id,
            registration_id,
            channel_status_id: AtomicI32::new(channel_status::NO_ID_ALLOCATED),
            images: RwLock::new(Vec::new()),
            available_image_handler,
            unavailable_image_handler,
            closed: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn channel_status_id(&self) -> i32 {
        self.channel_status_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_channel_status_id(&self, id: i32) {
        self.channel_status_id.store(id, Ordering::Release);
    }

    pub fn channel_status(&self) -> i64 {
        if self.is_closed() {
            return channel_status::NO_ID_ALLOCATED as i64;
        }
        counters::channel_status(&self.counters, self.channel_status_id())
    }

    pub fn images(&self) -> Vec<Arc<Image>> {
        self.images.read().clone()
    }

    pub fn image_count(&self) -> usize {
        self.images.read().len()
    }

    pub fn image_by_session_id(&self, session_id: i32) -> Option<Arc<Image>> {
        self.images.read().iter().find(|i| i.session_id == session_id).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.images.read().iter().any(|i| !i.is_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_rcv_destination(&self, endpoint_channel: &str) -> Result<()> {
        self.conductor()?.add_rcv_destination(self.registration_id, endpoint_channel)
    }

    pub fn remove_rcv_destination(&self, endpoint_channel: &str) -> Result<()> {
        self.conductor()?.remove_rcv_destination(self.registration_id, endpoint_channel)
    }

    pub fn async_add_rcv_destination(&self, endpoint_channel: &str) -> Result<i64> {
        self.conductor()?.async_add_rcv_destination(self.registration_id, endpoint_channel)
    }

    pub fn async_remove_rcv_destination(&self, endpoint_channel: &str) -> Result<i64> {
        self.conductor()?.async_remove_rcv_destination(self.registration_id, endpoint_channel)
    }

    /// Release the subscription and its images. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.conductor.upgrade() {
            Some(conductor) => conductor.release_subscription(self),
            None => {
                self.internal_close();
                Ok(())
            }
        }
    }

    fn conductor(&self) -> Result<Arc<ClientConductor>> {
        self.conductor.upgrade().ok_or(crate::error::Error::ClientClosed)
    }

    pub(crate) fn add_image(&self, image: Arc<Image>) {
        self.images.write().push(image);
    }

    pub(crate) fn remove_image(&self, correlation_id: i64) -> Option<Arc<Image>> {
        let mut images = self.images.write();
        let idx = images.iter().position(|i| i.correlation_id == correlation_id)?;
        let image = images.remove(idx);
        image.close();
        Some(image)
    }

    /// Mark closed and detach every image. The caller releases their log
    /// buffers and notifies the unavailable-image handler.
    pub(crate) fn internal_close(&self) -> Vec<Arc<Image>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let images = std::mem::take(&mut *self.images.write());
        for image in &images {
            image.close();
        }
        images
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("stream_id", &self.stream_id)
            .field("registration_id", &self.registration_id)
            .field("channel_status_id", &self.channel_status_id())
            .field("image_count", &self.image_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Counter
// ---------------------------------------------------------------------------

/// A counter this client asked the driver to allocate.
pub struct Counter {
    pub(crate) conductor: Weak<ClientConductor>,
    pub(crate) registration_id: i64,
    pub(crate) counter: AtomicCounter,
    pub(crate) closed: AtomicBool,
}

impl Counter {
    pub fn id(&self) -> i32 {
        self.counter.id()
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn get(&self) -> i64 {
        self.counter.get()
    }

    pub fn set(&self, value: i64) {
        self.counter.set_ordered(value);
    }

    /// Returns the previous value.
    pub fn increment(&self) -> i64 {
        self.counter.increment()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.conductor.upgrade() {
            Some(conductor) => conductor.release_counter(self),
            None => {
                self.internal_close();
                Ok(())
            }
        }
    }

    pub(crate) fn internal_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("id", &self.id())
            .field("registration_id", &self.registration_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// Anything the registry tracks by registration id. Images live inside
/// their subscription rather than in the registry.
#[derive(Clone)]
pub enum Resource {
    Publication(Arc<Publication>),
    Subscription(Arc<Subscription>),
    Counter(Arc<Counter>),
}

impl Resource {
    /// Status indicator of the channel endpoint, if the resource has one.
    pub fn channel_status_id(&self) -> Option<i32> {
        match self {
            Resource::Publication(p) => Some(p.channel_status_id()),
            Resource::Subscription(s) => Some(s.channel_status_id()),
            Resource::Counter(_) => None,
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Publication(p) => p.fmt(f),
            Resource::Subscription(s) => s.fmt(f),
            Resource::Counter(c) => c.fmt(f),
        }
    }
}
