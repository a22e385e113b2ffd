use crate::{
    domains::DomainConfigStore,
    envelope::{BounceIntent, Delivery, Envelope, EnvelopeId, RemoteResponse},
    pipeline::{ByteStream, PipelineError},
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
    #[error("message {0} not found")]
    NotFound(EnvelopeId),
    #[error("message stream failed: {0}")]
    Stream(#[from] PipelineError),
}

/// Parameters of an ordered per-zone pop.
pub struct ShiftOptions {
    /// Identity of the worker taking the lock; a `(id, seq)` is in flight
    /// for at most one lock owner at any instant.
    pub lock_owner: String,
    /// Consulted for per-domain connection caps while picking a candidate.
    pub domain_config: Arc<DomainConfigStore>,
}

/// Callback fired when a cache entry expires, with the key and stored value.
pub type CacheExpiry = Box<dyn FnOnce(&str, &serde_json::Value) + Send + 'static>;

/// The durable message store the core runs against. Provided externally in
/// production; `memory::MemoryQueue` backs development and tests.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Next value of the global sequence index, used as envelope id.
    async fn next_id(&self) -> Result<EnvelopeId, QueueError>;

    /// Persist the message byte stream, draining it fully.
    async fn store(&self, id: &str, message: ByteStream) -> Result<(), QueueError>;

    /// Persist the envelope metadata alongside the stored blob.
    async fn set_meta(&self, id: &str, envelope: &Envelope) -> Result<(), QueueError>;

    /// Fan the envelope out into per-recipient deliveries, each routed to
    /// its sending zone, and make them available for dispatch.
    async fn push(&self, id: &str, envelope: &Envelope) -> Result<(), QueueError>;

    /// Ordered pop of the next dispatchable delivery for a zone, locked to
    /// the given owner. Push order is preserved per zone.
    async fn shift(
        &self,
        zone: &str,
        options: &ShiftOptions,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Finish a delivery, successfully or with a bounce intent. The lock is
    /// released and the message is dropped once its last delivery is done.
    async fn release_delivery(
        &self,
        delivery: &Delivery,
        bounce: Option<BounceIntent>,
    ) -> Result<(), QueueError>;

    /// Re-queue a delivery for a later attempt.
    async fn defer_delivery(
        &self,
        delivery: &Delivery,
        ttl: chrono::Duration,
        response: &RemoteResponse,
    ) -> Result<(), QueueError>;

    /// Tear down a stored message and any deliveries not currently locked.
    async fn remove_message(&self, id: &str) -> Result<(), QueueError>;

    /// Stream a stored message back, Received-header-less wire form.
    async fn retrieve(&self, id: &str) -> Result<ByteStream, QueueError>;

    /// Re-offer every delivery locked by a dead owner.
    async fn release_owner_locks(&self, lock_owner: &str) -> Result<(), QueueError>;

    /// TTL cache with an expiry callback, used for blacklist entries.
    async fn cache_set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: std::time::Duration,
        on_expire: Option<CacheExpiry>,
    ) -> Result<(), QueueError>;
}
