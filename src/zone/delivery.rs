use crate::{
    domains::DomainConfigStore,
    envelope::{BounceIntent, Delivery, RemoteResponse, ResponseCategory},
    pool::PoolEntry,
    queue::{Queue, ShiftOptions},
    zone::{
        ZoneRuntime,
        dns::{DnsResolver, Exchange},
    },
};
use chrono::Utc;
use futures::StreamExt;
use mail_send::SmtpClientBuilder;
use std::{sync::Arc, time::Duration};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const IDLE_POLL: Duration = Duration::from_secs(1);
const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// One worker of a sending zone: shifts deliveries off the queue, selects a
/// source address, attempts the remote transaction and settles the result
/// with the queue. `connections` lanes run concurrently inside one worker.
pub struct DeliveryWorker {
    lock_owner: String,
    zone: String,
    runtime: watch::Receiver<Arc<ZoneRuntime>>,
    queue: Arc<dyn Queue>,
    domains: Arc<DomainConfigStore>,
    resolver: DnsResolver,
    /// Our own hostname, named in synthesized Received headers.
    hostname: String,
    shutdown: CancellationToken,
}

enum Settled {
    Delivered,
    Deferred,
    Bounced,
}

impl Settled {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::Bounced => "bounced",
        }
    }
}

impl DeliveryWorker {
    pub fn new(
        zone: String,
        runtime: watch::Receiver<Arc<ZoneRuntime>>,
        queue: Arc<dyn Queue>,
        domains: Arc<DomainConfigStore>,
        resolver: DnsResolver,
        hostname: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lock_owner: format!("{}.{}", zone, Uuid::new_v4()),
            zone,
            runtime,
            queue,
            domains,
            resolver,
            hostname,
            shutdown,
        }
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    /// Worker main loop. Signals readiness once its lanes are up; the
    /// supervisor kills workers that never do.
    pub async fn run(self: Arc<Self>, ready: oneshot::Sender<()>) {
        let lanes = self.runtime.borrow().config().connections.max(1);
        let _ = ready.send(());

        debug!(zone = self.zone, lock_owner = self.lock_owner, lanes, "worker started");

        futures::future::join_all((0..lanes).map(|lane| self.clone().lane(lane))).await;

        debug!(zone = self.zone, lock_owner = self.lock_owner, "worker drained");
    }

    async fn lane(self: Arc<Self>, lane: usize) {
        let options = ShiftOptions {
            lock_owner: self.lock_owner.clone(),
            domain_config: self.domains.clone(),
        };

        while !self.shutdown.is_cancelled() {
            let delivery = match self.queue.shift(&self.zone, &options).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(IDLE_POLL) => continue,
                    }
                }
                Err(err) => {
                    error!(zone = self.zone, lane, "queue shift failed: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            trace!(
                zone = self.zone,
                lane,
                id = delivery.id,
                seq = delivery.seq,
                "delivery shifted"
            );
            self.process(delivery).await;
        }
    }

    async fn process(&self, mut delivery: Delivery) {
        delivery.attempts += 1;
        let runtime = self.runtime.borrow().clone();

        runtime.throttle_wait(&delivery.domain).await;

        let disabled = self.domains.disabled_addresses(&delivery.domain);
        let source = runtime.get_address(&mut delivery, false, &disabled);
        if delivery.pool_disabled {
            warn!(
                code = "DISABLEBL",
                zone = self.zone,
                domain = delivery.domain,
                "blacklist filter bypassed to keep the pool usable"
            );
        }

        let result = match self.fetch_message(&delivery).await {
            Ok(message) => self.send_to_domain(&delivery, &source, &runtime, &message).await,
            Err(response) => Err(response),
        };

        let outcome = self.settle(&delivery, &runtime, result).await;
        debug!(
            zone = self.zone,
            id = delivery.id,
            seq = delivery.seq,
            outcome = outcome.as_str(),
            "delivery settled"
        );
    }

    /// Stored wire form with the outbound Received header prepended, which
    /// must be in place before the first DATA byte goes out.
    async fn fetch_message(&self, delivery: &Delivery) -> Result<Vec<u8>, RemoteResponse> {
        let mut stream = self
            .queue
            .retrieve(&delivery.id)
            .await
            .map_err(|err| RemoteResponse::transient(format!("queue unavailable: {err}")))?;

        let mut message = self.received_header(delivery).into_bytes();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| RemoteResponse::transient(format!("queue stream failed: {err}")))?;
            message.extend_from_slice(&chunk);
        }
        Ok(message)
    }

    fn received_header(&self, delivery: &Delivery) -> String {
        let envelope = &delivery.envelope;

        let mut header = format!("Received: from {}", envelope.transhost);
        match &envelope.originhost {
            Some(host) => header.push_str(&format!(" ({host} [{}])", envelope.origin)),
            None => header.push_str(&format!(" ([{}])", envelope.origin)),
        }
        if envelope.is_authenticated() {
            header.push_str(&format!("\r\n\t(Authenticated sender: {})", envelope.user));
        }
        header.push_str(&format!(
            "\r\n\tby {} (Mailzone) with {} id {}.{}",
            self.hostname, envelope.transtype, delivery.id, delivery.seq
        ));
        if let Some(tls) = &envelope.tls {
            header.push_str(&format!("\r\n\t(version={} cipher={})", tls.version, tls.name));
        }
        header.push_str(&format!(
            "\r\n\tfor <{}>;\r\n\t{}\r\n",
            delivery.recipient,
            Utc::now().format("%a, %d %b %Y %H:%M:%S +0000")
        ));
        header
    }

    /// Walk the MX ladder, one attempt per preference level. The first
    /// permanent remote verdict stops the walk; transient verdicts move on
    /// to the next exchange.
    async fn send_to_domain(
        &self,
        delivery: &Delivery,
        source: &PoolEntry,
        runtime: &ZoneRuntime,
        message: &[u8],
    ) -> Result<(), RemoteResponse> {
        let mut exchanges = self.resolver.walk(&delivery.domain);
        let mut last_transient: Option<RemoteResponse> = None;

        loop {
            let exchange = match exchanges.next().await {
                Ok(Some(exchange)) => exchange,
                Ok(None) => break,
                Err(err) => {
                    info!(domain = delivery.domain, "could not resolve mail domain: {err}");
                    return Err(RemoteResponse::transient(format!(
                        "DNS lookup of {} failed: {err}",
                        delivery.domain
                    )));
                }
            };

            match self
                .attempt(delivery, source, runtime, &exchange, message)
                .await
            {
                Ok(()) => return Ok(()),
                Err(response) if response.category == ResponseCategory::Permanent => {
                    return Err(response);
                }
                Err(response) => last_transient = Some(response),
            }
        }

        Err(last_transient.unwrap_or_else(|| {
            RemoteResponse::permanent(format!("no mail exchange of {} accepted the message", delivery.domain))
        }))
    }

    async fn attempt(
        &self,
        delivery: &Delivery,
        source: &PoolEntry,
        runtime: &ZoneRuntime,
        exchange: &Exchange,
        message: &[u8],
    ) -> Result<(), RemoteResponse> {
        let helo_host = source
            .name
            .clone()
            .or_else(|| runtime.config().host.clone())
            .unwrap_or_else(|| self.hostname.clone());

        let make_builder = || {
            let mut builder = SmtpClientBuilder::new(exchange.host.clone(), exchange.port)
                .implicit_tls(false)
                .local_ip(source.address)
                .helo_host(helo_host.clone())
                .timeout(REMOTE_TIMEOUT);
            if let Some(auth) = &runtime.config().auth {
                builder = builder.credentials((auth.username.clone(), auth.password.clone()));
            }
            builder
        };

        let smtp_message = mail_send::smtp::message::Message {
            mail_from: delivery.envelope.from.as_str().into(),
            rcpt_to: vec![delivery.recipient.as_str().into()],
            body: message.into(),
        };

        // opportunistic TLS: try STARTTLS first, fall back to plaintext
        let result = match make_builder().connect().await {
            Ok(mut client) => {
                trace!(host = exchange.host, port = exchange.port, "connected with TLS");
                let result = client.send(smtp_message.clone()).await;
                client.quit().await.ok();
                result
            }
            Err(tls_err) => {
                debug!(
                    host = exchange.host,
                    port = exchange.port,
                    "TLS connection failed, retrying plain: {tls_err}"
                );
                match make_builder().connect_plain().await {
                    Ok(mut client) => {
                        let result = client.send(smtp_message).await;
                        client.quit().await.ok();
                        result
                    }
                    Err(err) => Err(err),
                }
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    host = exchange.host,
                    port = exchange.port,
                    source = %source.address,
                    "message accepted by remote"
                );
                Ok(())
            }
            Err(err) => {
                info!(host = exchange.host, port = exchange.port, "could not use exchange: {err}");
                Err(self.classify(&err, source))
            }
        }
    }

    /// Map a client error onto the defer/bounce/blacklist triage.
    fn classify(&self, err: &mail_send::Error, source: &PoolEntry) -> RemoteResponse {
        let message = err.to_string();

        let permanent = match err {
            mail_send::Error::UnexpectedReply(response)
            | mail_send::Error::AuthenticationFailed(response) => {
                response.severity() == smtp_proto::Severity::PermanentNegativeCompletion
            }
            mail_send::Error::MissingCredentials
            | mail_send::Error::MissingMailFrom
            | mail_send::Error::MissingRcptTo
            | mail_send::Error::UnsupportedAuthMechanism
            | mail_send::Error::MissingStartTls => true,
            _ => false,
        };

        if is_blacklist_response(&message) {
            return RemoteResponse {
                category: ResponseCategory::Blacklist,
                message,
                source_address: Some(source.address),
            };
        }

        if permanent {
            RemoteResponse::permanent(message)
        } else {
            RemoteResponse::transient(message)
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        runtime: &ZoneRuntime,
        result: Result<(), RemoteResponse>,
    ) -> Settled {
        match result {
            Ok(()) => {
                info!(
                    zone = self.zone,
                    id = delivery.id,
                    seq = delivery.seq,
                    recipient = delivery.recipient,
                    attempt = delivery.attempts,
                    "delivered"
                );
                if let Err(err) = self.queue.release_delivery(delivery, None).await {
                    error!(id = delivery.id, seq = delivery.seq, "release failed: {err}");
                }
                Settled::Delivered
            }
            Err(response) if response.category == ResponseCategory::Permanent => {
                self.bounce(delivery, &response.message).await;
                Settled::Bounced
            }
            Err(response) => {
                if delivery.attempts >= runtime.config().retry.max_attempts {
                    self.bounce(
                        delivery,
                        &format!("retry limit reached: {}", response.message),
                    )
                    .await;
                    return Settled::Bounced;
                }

                if response.category == ResponseCategory::Blacklist {
                    self.blacklist_source(delivery, runtime, &response).await;
                }

                let ttl = runtime.config().retry.backoff(delivery.attempts);
                info!(
                    zone = self.zone,
                    id = delivery.id,
                    seq = delivery.seq,
                    attempt = delivery.attempts,
                    defer_secs = ttl.num_seconds(),
                    response = response.message,
                    "delivery deferred"
                );
                if let Err(err) = self.queue.defer_delivery(delivery, ttl, &response).await {
                    error!(id = delivery.id, seq = delivery.seq, "defer failed: {err}");
                }
                Settled::Deferred
            }
        }
    }

    async fn bounce(&self, delivery: &Delivery, reason: &str) {
        info!(
            zone = self.zone,
            id = delivery.id,
            seq = delivery.seq,
            recipient = delivery.recipient,
            response = reason,
            "delivery bounced"
        );
        let intent = BounceIntent {
            id: delivery.id.clone(),
            seq: delivery.seq,
            recipient: delivery.recipient.clone(),
            response: reason.to_string(),
            time: Utc::now(),
        };
        if let Err(err) = self.queue.release_delivery(delivery, Some(intent)).await {
            error!(id = delivery.id, seq = delivery.seq, "release failed: {err}");
        }
    }

    /// Suppress the source address for this domain until the blacklist TTL
    /// runs out, then let the cache expiry put it back.
    async fn blacklist_source(
        &self,
        delivery: &Delivery,
        runtime: &ZoneRuntime,
        response: &RemoteResponse,
    ) {
        let Some(address) = response.source_address else {
            return;
        };
        if !self.domains.add_disabled_address(&delivery.domain, address) {
            return;
        }

        let key = format!("blacklist:{}:{}", delivery.domain, address);
        let value = serde_json::json!({
            "response": response.message,
            "created": Utc::now().to_rfc3339(),
        });

        let domains = self.domains.clone();
        let domain = delivery.domain.clone();
        let expiry: crate::queue::CacheExpiry = Box::new(move |_key, _value| {
            domains.remove_disabled_address(&domain, address);
        });

        if let Err(err) = self
            .queue
            .cache_set(&key, value, runtime.config().blacklist_ttl(), Some(expiry))
            .await
        {
            error!(key, "failed to record blacklist entry: {err}");
        }
    }
}

fn is_blacklist_response(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "blacklist",
        "blocklist",
        "blocked using",
        "spamhaus",
        "banned sending ip",
        "poor reputation",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        envelope::Envelope,
        pipeline::stream_from,
        queue::memory::MemoryQueue,
        router::{Router, RoutingTables},
        zone::{ZoneConfig, ZoneRuntime},
    };
    use mailcrab::TestMailServerHandle;
    use std::net::Ipv4Addr;

    fn random_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn queue_with_message(recipient: &str) -> (Arc<MemoryQueue>, Envelope) {
        let router = Router::new(RoutingTables {
            default_zone: Some("default".to_string()),
            ..Default::default()
        });
        let queue = Arc::new(MemoryQueue::new(Arc::new(router)));

        let mut envelope = Envelope::default();
        envelope.id = queue.next_id().await.unwrap();
        envelope.from = "sender@example.com".to_string();
        envelope.transhost = "client.example.com".to_string();
        envelope.sending_zone = "default".to_string();
        envelope.add_recipient(recipient.to_string());

        queue
            .store(
                &envelope.id,
                stream_from(&b"Subject: outbound test\r\n\r\nhello remote\r\n"[..]),
            )
            .await
            .unwrap();
        queue.set_meta(&envelope.id, &envelope).await.unwrap();
        queue.push(&envelope.id, &envelope).await.unwrap();
        (queue, envelope)
    }

    fn worker(
        queue: Arc<MemoryQueue>,
        domains: Arc<DomainConfigStore>,
        mailcrab_port: u16,
    ) -> (Arc<DeliveryWorker>, watch::Sender<Arc<ZoneRuntime>>) {
        let mut config = ZoneConfig::named("default");
        config.pool = vec![crate::pool::PoolEntry::new("127.0.0.1".parse().unwrap())];
        let (runtime_tx, runtime_rx) = watch::channel(Arc::new(ZoneRuntime::new(config)));

        let worker = DeliveryWorker::new(
            "default".to_string(),
            runtime_rx,
            queue,
            domains,
            DnsResolver::mock("localhost", mailcrab_port),
            "mta.test.example".to_string(),
            CancellationToken::new(),
        );
        (Arc::new(worker), runtime_tx)
    }

    #[tokio::test]
    async fn delivers_a_queued_message() {
        crate::install_crypto_provider();
        let mailcrab_port = random_port();
        let TestMailServerHandle { token, mut rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), mailcrab_port).await;
        let _guard = token.drop_guard();

        let (queue, envelope) = queue_with_message("rcpt@example.net").await;
        let domains = Arc::new(DomainConfigStore::default());
        let (worker, _runtime) = worker(queue.clone(), domains.clone(), mailcrab_port);

        let options = ShiftOptions {
            lock_owner: worker.lock_owner().to_string(),
            domain_config: domains,
        };
        let delivery = queue.shift("default", &options).await.unwrap().unwrap();
        worker.process(delivery).await;

        // accepted remotely and fully settled with the queue
        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject, "outbound test");
        assert!(matches!(
            queue.retrieve(&envelope.id).await,
            Err(crate::queue::QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_remote_defers_the_delivery() {
        crate::install_crypto_provider();
        // nothing listens on this port
        let dead_port = random_port();
        let (queue, envelope) = queue_with_message("rcpt@example.net").await;
        let domains = Arc::new(DomainConfigStore::default());
        let (worker, _runtime) = worker(queue.clone(), domains.clone(), dead_port);

        let options = ShiftOptions {
            lock_owner: worker.lock_owner().to_string(),
            domain_config: domains,
        };
        let delivery = queue.shift("default", &options).await.unwrap().unwrap();
        worker.process(delivery).await;

        // still stored, waiting for the retry
        assert!(queue.retrieve(&envelope.id).await.is_ok());
    }

    #[test]
    fn received_header_shape() {
        let queue_router = Router::new(RoutingTables::default());
        let queue = Arc::new(MemoryQueue::new(Arc::new(queue_router)));
        let domains = Arc::new(DomainConfigStore::default());
        let (worker, _runtime_tx) = worker(queue, domains, 25);

        let mut envelope = Envelope::default();
        envelope.id = "abc123".to_string();
        envelope.transhost = "client.example.com".to_string();
        envelope.transtype = "ESMTPSA".to_string();
        envelope.user = "auth-user".to_string();
        envelope.tls = Some(crate::envelope::TlsInfo {
            version: "TLSv1.3".to_string(),
            name: "TLS_AES_256_GCM_SHA384".to_string(),
        });
        let delivery = Delivery::new(&envelope, 2, "rcpt@example.net".to_string(), "default".into());

        let header = worker.received_header(&delivery);

        assert!(header.starts_with("Received: from client.example.com"));
        assert!(header.contains("(Authenticated sender: auth-user)"));
        assert!(header.contains("by mta.test.example (Mailzone) with ESMTPSA id abc123.2"));
        assert!(header.contains("(version=TLSv1.3 cipher=TLS_AES_256_GCM_SHA384)"));
        assert!(header.contains("for <rcpt@example.net>;"));
        assert!(header.contains("+0000\r\n"));
    }

    #[test]
    fn blacklist_responses_are_recognized() {
        assert!(is_blacklist_response(
            "554 5.7.1 Service unavailable; client host blocked using zen.spamhaus.org"
        ));
        assert!(!is_blacklist_response("451 4.3.0 Temporary local problem"));
    }
}
