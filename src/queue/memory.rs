use crate::{
    envelope::{BounceIntent, Delivery, Envelope, EnvelopeId, RemoteResponse},
    headers::Headers,
    pipeline::{ByteStream, stream_from},
    queue::{CacheExpiry, Queue, QueueError, ShiftOptions},
    router::Router,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info};

/// In-process queue backend. Good enough for development, single-node
/// setups and the test suite; it honors the same ordering and locking
/// contract a durable backend provides.
pub struct MemoryQueue {
    router: Arc<Router>,
    seq: AtomicU64,
    inner: Mutex<Inner>,
    cache: Arc<Mutex<HashMap<String, u64>>>,
    cache_generation: AtomicU64,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<EnvelopeId, StoredMessage>,
    zones: HashMap<String, ZoneState>,
    locks: HashMap<(EnvelopeId, u32), LockedDelivery>,
    in_flight: HashMap<String, usize>,
    remaining: HashMap<EnvelopeId, usize>,
}

struct LockedDelivery {
    owner: String,
    delivery: Delivery,
}

struct StoredMessage {
    body: Vec<u8>,
    meta: Option<Envelope>,
}

#[derive(Default)]
struct ZoneState {
    ready: VecDeque<Delivery>,
    deferred: Vec<Delivery>,
}

impl MemoryQueue {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            seq: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
            cache: Arc::new(Mutex::new(HashMap::new())),
            cache_generation: AtomicU64::new(1),
        }
    }

    fn decrement_in_flight(inner: &mut Inner, domain: &str) {
        if let Some(count) = inner.in_flight.get_mut(domain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.in_flight.remove(domain);
            }
        }
    }

    fn unlock(inner: &mut Inner, delivery: &Delivery) {
        inner
            .locks
            .remove(&(delivery.id.clone(), delivery.seq));
        Self::decrement_in_flight(inner, &delivery.domain);
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn next_id(&self) -> Result<EnvelopeId, QueueError> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{:011x}{:04x}", Utc::now().timestamp_millis(), n & 0xffff))
    }

    async fn store(&self, id: &str, mut message: ByteStream) -> Result<(), QueueError> {
        let mut body = Vec::new();
        while let Some(chunk) = message.next().await {
            body.extend_from_slice(&chunk?);
        }

        let mut inner = self.inner.lock().unwrap();
        inner
            .messages
            .insert(id.to_string(), StoredMessage { body, meta: None });
        Ok(())
    }

    async fn set_meta(&self, id: &str, envelope: &Envelope) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        message.meta = Some(envelope.clone());
        Ok(())
    }

    async fn push(&self, id: &str, envelope: &Envelope) -> Result<(), QueueError> {
        let headers = Headers::parse((envelope.headers.join("\r\n") + "\r\n").as_bytes());

        let mut inner = self.inner.lock().unwrap();
        if !inner.messages.contains_key(id) {
            return Err(QueueError::NotFound(id.to_string()));
        }

        for (index, recipient) in envelope.to.iter().enumerate() {
            let zone = self
                .router
                .zone_for(envelope, &headers, Some(recipient))
                .unwrap_or_else(|| envelope.sending_zone.clone());
            let delivery = Delivery::new(envelope, index as u32 + 1, recipient.clone(), zone);

            debug!(
                id,
                seq = delivery.seq,
                recipient,
                zone = delivery.sending_zone,
                "delivery queued"
            );
            inner
                .zones
                .entry(delivery.sending_zone.clone())
                .or_default()
                .ready
                .push_back(delivery);
        }
        inner.remaining.insert(id.to_string(), envelope.to.len());
        Ok(())
    }

    async fn shift(
        &self,
        zone: &str,
        options: &ShiftOptions,
    ) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(state) = inner.zones.get_mut(zone) else {
            return Ok(None);
        };

        // deferred deliveries rejoin the ready queue once due
        let mut due: Vec<Delivery> = Vec::new();
        state.deferred.retain(|d| {
            if d.next_attempt <= now {
                due.push(d.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|d| d.next_attempt);
        for delivery in due {
            state.ready.push_back(delivery);
        }

        let candidate = state.ready.iter().position(|d| {
            let active = inner.in_flight.get(&d.domain).copied().unwrap_or(0);
            active < options.domain_config.max_connections(&d.domain)
        });
        let Some(index) = candidate else {
            return Ok(None);
        };
        let delivery = state.ready.remove(index).unwrap();

        inner.locks.insert(
            (delivery.id.clone(), delivery.seq),
            LockedDelivery {
                owner: options.lock_owner.clone(),
                delivery: delivery.clone(),
            },
        );
        *inner.in_flight.entry(delivery.domain.clone()).or_default() += 1;

        Ok(Some(delivery))
    }

    async fn release_delivery(
        &self,
        delivery: &Delivery,
        bounce: Option<BounceIntent>,
    ) -> Result<(), QueueError> {
        if let Some(bounce) = &bounce {
            info!(
                id = bounce.id,
                seq = bounce.seq,
                recipient = bounce.recipient,
                response = bounce.response,
                "delivery bounced"
            );
        }

        let mut inner = self.inner.lock().unwrap();
        Self::unlock(&mut inner, delivery);

        let done = match inner.remaining.get_mut(&delivery.id) {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if done {
            inner.remaining.remove(&delivery.id);
            inner.messages.remove(&delivery.id);
            debug!(id = delivery.id, "message fully processed, dropped");
        }
        Ok(())
    }

    async fn defer_delivery(
        &self,
        delivery: &Delivery,
        ttl: chrono::Duration,
        response: &RemoteResponse,
    ) -> Result<(), QueueError> {
        let mut deferred = delivery.clone();
        deferred.next_attempt = Utc::now() + ttl;

        debug!(
            id = delivery.id,
            seq = delivery.seq,
            until = %deferred.next_attempt,
            response = response.message,
            "delivery deferred"
        );

        let mut inner = self.inner.lock().unwrap();
        Self::unlock(&mut inner, delivery);
        inner
            .zones
            .entry(deferred.sending_zone.clone())
            .or_default()
            .deferred
            .push(deferred);
        Ok(())
    }

    async fn remove_message(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.messages.remove(id);
        inner.remaining.remove(id);
        for state in inner.zones.values_mut() {
            state.ready.retain(|d| d.id != id);
            state.deferred.retain(|d| d.id != id);
        }
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<ByteStream, QueueError> {
        let inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        Ok(stream_from(message.body.clone()))
    }

    async fn release_owner_locks(&self, lock_owner: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();

        let orphaned: Vec<(EnvelopeId, u32)> = inner
            .locks
            .iter()
            .filter(|(_, lock)| lock.owner == lock_owner)
            .map(|(key, _)| key.clone())
            .collect();

        for key in orphaned {
            let Some(lock) = inner.locks.remove(&key) else {
                continue;
            };
            let delivery = lock.delivery;
            Self::decrement_in_flight(&mut inner, &delivery.domain);
            info!(id = key.0, seq = key.1, lock_owner, "re-offering unacked delivery");
            inner
                .zones
                .entry(delivery.sending_zone.clone())
                .or_default()
                .ready
                .push_front(delivery);
        }
        Ok(())
    }

    async fn cache_set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
        on_expire: Option<CacheExpiry>,
    ) -> Result<(), QueueError> {
        let generation = self.cache_generation.fetch_add(1, Ordering::Relaxed);
        self.cache
            .lock()
            .unwrap()
            .insert(key.to_string(), generation);

        let cache = self.cache.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;

            let expired = {
                let mut cache = cache.lock().unwrap();
                match cache.get(&key) {
                    Some(&current) if current == generation => {
                        cache.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if expired && let Some(on_expire) = on_expire {
                on_expire(&key, &value);
            }
        });
        Ok(())
    }
}
