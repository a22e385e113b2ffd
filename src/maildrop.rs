use crate::{
    envelope::Envelope,
    headers::Headers,
    hooks::{HookBus, HookName, HookPayload},
    pipeline::{ByteStream, PipelineError, dkim, limits, parser, splitter},
    queue::{Queue, QueueError},
    response::SmtpResponse,
    router::Router,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MailDropError {
    #[error("{0}")]
    Queue(#[from] QueueError),
    #[error("{0}")]
    Rejected(SmtpResponse),
    #[error("body hash signal lost")]
    HashSignalLost,
}

impl MailDropError {
    /// The SMTP reply the ingress should give the client. Protocol-level
    /// failures pass through verbatim; infrastructure trouble is a 451.
    pub fn response(&self) -> SmtpResponse {
        match self {
            Self::Rejected(response) => response.clone(),
            Self::Queue(QueueError::Stream(PipelineError::Response(response))) => {
                response.clone()
            }
            _ => SmtpResponse::service_unavailable(),
        }
    }
}

/// Assembles the streaming pipeline on message receipt, computes metadata
/// and commits the message to the queue:
///
/// `source -> analyzers -> splitter -> rewriters -> streamers -> parser
///  -> body hash -> queue.store`
pub struct MailDrop {
    queue: Arc<dyn Queue>,
    hooks: Arc<HookBus>,
    router: Arc<Router>,
    hostname: String,
}

impl MailDrop {
    pub fn new(
        queue: Arc<dyn Queue>,
        hooks: Arc<HookBus>,
        router: Arc<Router>,
        hostname: String,
    ) -> Self {
        Self {
            queue,
            hooks,
            router,
            hostname,
        }
    }

    /// Run a message through the pipeline and queue it. On any failure the
    /// partially stored artifact is torn down before the error surfaces.
    pub async fn add(
        &self,
        mut envelope: Envelope,
        source: ByteStream,
    ) -> Result<SmtpResponse, MailDropError> {
        if envelope.id.is_empty() {
            envelope.id = self.queue.next_id().await?;
        }
        let id = envelope.id.clone();

        match self.ingest(envelope, source).await {
            Ok(response) => {
                self.log_entry("QUEUED", &format!("id={id} response={response}")).await;
                Ok(response)
            }
            Err(err) => {
                warn!(code = "NOQUEUE", id, response = %err.response(), "message not queued");
                if let Err(cleanup) = self.queue.remove_message(&id).await {
                    warn!(id, "failed to tear down stored message: {cleanup}");
                }
                self.log_entry("NOQUEUE", &format!("id={id} response={}", err.response()))
                    .await;
                Err(err)
            }
        }
    }

    /// Feed log shippers registered on the `log:entry` hook; their errors
    /// never affect the message.
    async fn log_entry(&self, code: &str, message: &str) {
        let _ = self
            .hooks
            .run(HookName::LogEntry, &mut HookPayload::LogEntry { code, message })
            .await;
    }

    async fn ingest(
        &self,
        envelope: Envelope,
        source: ByteStream,
    ) -> Result<SmtpResponse, MailDropError> {
        let id = envelope.id.clone();
        let algorithm = envelope.dkim.hash_algo;

        let shared = Arc::new(tokio::sync::Mutex::new(envelope));
        let header_snapshot: Arc<std::sync::Mutex<Vec<String>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        let source = limits::byte_counter(source, "ingress");
        let events = splitter::split(self.hooks.apply_analyzers(source));
        let events = self.hooks.apply_rewriters(events);
        let events = self.hooks.apply_streamers(events);

        let callback: parser::HeaderCallback = {
            let hooks = self.hooks.clone();
            let hostname = self.hostname.clone();
            let shared = shared.clone();
            let header_snapshot = header_snapshot.clone();

            Box::new(move |headers: &mut Headers| {
                let hooks = hooks.clone();
                let hostname = hostname.clone();
                let shared = shared.clone();
                let header_snapshot = header_snapshot.clone();

                let fut: futures::future::BoxFuture<'_, Result<(), SmtpResponse>> =
                    Box::pin(async move {
                        let mut envelope = shared.lock().await;

                        if !headers.contains("date") {
                            headers.prepend("Date", &Utc::now().to_rfc2822());
                        }
                        if !headers.contains("message-id") {
                            headers
                                .prepend("Message-ID", &format!("<{}@{}>", envelope.id, hostname));
                        }
                        let received = ingress_received(&envelope, &hostname);
                        headers.prepend("Received", &received);

                        hooks
                            .run(
                                HookName::MessageHeaders,
                                &mut HookPayload::MessageHeaders {
                                    envelope: &mut envelope,
                                    headers,
                                },
                            )
                            .await?;

                        *header_snapshot.lock().unwrap() =
                            headers.lines().iter().map(|l| l.raw().to_string()).collect();
                        Ok(())
                    });
                fut
            })
        };

        let (hashed, hash_ready) = dkim::body_hash(parser::join(events, callback), algorithm);

        // store drains the whole pipeline; stream failures surface here
        self.queue.store(&id, hashed).await?;
        let body_hash = hash_ready.await.map_err(|_| MailDropError::HashSignalLost)?;

        let mut envelope = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().await.clone(),
        };
        envelope.dkim.body_hash = Some(body_hash.hash);
        envelope.body_size = body_hash.body_size;
        envelope.headers = header_snapshot.lock().unwrap().clone();

        self.hooks
            .run(
                HookName::MessageStore,
                &mut HookPayload::MessageStore {
                    envelope: &mut envelope,
                },
            )
            .await
            .map_err(MailDropError::Rejected)?;

        self.hooks
            .run(
                HookName::MessageQueue,
                &mut HookPayload::MessageQueue {
                    envelope: &mut envelope,
                },
            )
            .await
            .map_err(MailDropError::Rejected)?;

        if envelope.sending_zone.is_empty() {
            let headers = Headers::parse((envelope.headers.join("\r\n") + "\r\n").as_bytes());
            match self.router.zone_for(&envelope, &headers, None) {
                Some(zone) => envelope.sending_zone = zone,
                None => {
                    return Err(MailDropError::Rejected(SmtpResponse::new(
                        550,
                        "5.3.5 No sending zone routes this message",
                    )));
                }
            }
        }

        self.queue.set_meta(&id, &envelope).await?;
        self.queue.push(&id, &envelope).await?;

        info!(
            code = "QUEUED",
            id,
            from = envelope.from,
            recipients = envelope.to.len(),
            zone = envelope.sending_zone,
            body_size = envelope.body_size,
            "message queued"
        );

        Ok(SmtpResponse::new(
            250,
            format!("2.6.0 Message queued as {id}"),
        ))
    }
}

fn ingress_received(envelope: &Envelope, hostname: &str) -> String {
    let origin = match &envelope.originhost {
        Some(host) => format!("({host} [{}])", envelope.origin),
        None => format!("([{}])", envelope.origin),
    };
    format!(
        "from {} {origin}\r\n\tby {hostname} (Mailzone) with {} id {};\r\n\t{}",
        envelope.transhost,
        envelope.transtype,
        envelope.id,
        Utc::now().format("%a, %d %b %Y %H:%M:%S +0000")
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        hooks::NamedHook,
        pipeline::{collect, limits, stream_from},
        queue::{ShiftOptions, memory::MemoryQueue},
        router::RoutingTables,
    };
    use async_trait::async_trait;
    use crate::domains::DomainConfigStore;

    fn setup(default_zone: Option<&str>, hooks: HookBus) -> (MailDrop, Arc<MemoryQueue>) {
        let router = Arc::new(Router::new(RoutingTables {
            default_zone: default_zone.map(String::from),
            ..Default::default()
        }));
        let queue = Arc::new(MemoryQueue::new(router.clone()));
        let drop = MailDrop::new(
            queue.clone(),
            Arc::new(hooks),
            router,
            "mx.test.example".to_string(),
        );
        (drop, queue)
    }

    fn envelope(recipients: &[&str]) -> Envelope {
        let mut envelope = Envelope::default();
        envelope.from = "sender@example.com".to_string();
        envelope.transhost = "client.example.com".to_string();
        for recipient in recipients {
            envelope.add_recipient(recipient.to_string());
        }
        envelope
    }

    #[tokio::test]
    async fn accepts_and_queues_a_message() {
        let (drop, queue) = setup(Some("default"), HookBus::new());

        let response = drop
            .add(
                envelope(&["rcpt@example.net"]),
                stream_from(&b"Subject: t\r\n\r\nhello\r\n"[..]),
            )
            .await
            .unwrap();
        assert_eq!(response.code, 250);

        let options = ShiftOptions {
            lock_owner: "w1".to_string(),
            domain_config: Arc::new(DomainConfigStore::default()),
        };
        let delivery = queue.shift("default", &options).await.unwrap().unwrap();
        assert_eq!(delivery.recipient, "rcpt@example.net");
        assert_eq!(delivery.envelope.body_size, 7);
        assert!(delivery.envelope.dkim.body_hash.is_some());
        assert_eq!(delivery.envelope.sending_zone, "default");

        let stored = collect(queue.retrieve(&delivery.id).await.unwrap())
            .await
            .unwrap();
        let stored = String::from_utf8(stored).unwrap();
        assert!(stored.starts_with("Received: from client.example.com"));
        assert!(stored.contains("\r\nMessage-ID: <"));
        assert!(stored.contains("\r\nDate: "));
        assert!(stored.ends_with("\r\n\r\nhello\r\n"));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_and_removed() {
        let (drop, queue) = setup(Some("default"), HookBus::new());

        let body = format!("Subject: t\r\n\r\n{}\r\n", "x".repeat(200));
        let source = limits::size_limiter(stream_from(body.into_bytes()), 64);

        let envelope = envelope(&["rcpt@example.net"]);
        let err = drop.add(envelope, source).await.unwrap_err();
        assert_eq!(err.response().code, 552);

        let options = ShiftOptions {
            lock_owner: "w1".to_string(),
            domain_config: Arc::new(DomainConfigStore::default()),
        };
        assert!(queue.shift("default", &options).await.unwrap().is_none());
    }

    struct RejectStore;

    #[async_trait]
    impl NamedHook for RejectStore {
        async fn call(&self, _: &mut HookPayload<'_>) -> Result<(), SmtpResponse> {
            Err(SmtpResponse::new(451, "4.3.0 Storage policy says no"))
        }
    }

    #[tokio::test]
    async fn store_hook_failure_tears_down_the_message() {
        let mut hooks = HookBus::new();
        hooks.add_hook(HookName::MessageStore, Arc::new(RejectStore));
        let (drop, queue) = setup(Some("default"), hooks);

        let err = drop
            .add(
                envelope(&["rcpt@example.net"]),
                stream_from(&b"Subject: t\r\n\r\nhello\r\n"[..]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.response().code, 451);

        let options = ShiftOptions {
            lock_owner: "w1".to_string(),
            domain_config: Arc::new(DomainConfigStore::default()),
        };
        assert!(queue.shift("default", &options).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unroutable_message_is_bounced() {
        let (drop, _queue) = setup(None, HookBus::new());

        let err = drop
            .add(
                envelope(&["rcpt@example.net"]),
                stream_from(&b"Subject: t\r\n\r\nhello\r\n"[..]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.response().code, 550);
    }
}
