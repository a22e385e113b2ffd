use crate::{hooks::HookBus, maildrop::MailDrop, pipeline::dkim::HashAlgorithm, queue::Queue};
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;

pub mod connection;
pub mod server;
mod session;

fn default_max_size() -> u64 {
    30 * 1024 * 1024
}

fn default_max_recipients() -> usize {
    100
}

/// One configured SMTP listener (submission or relay variant).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    /// Interface label recorded on every envelope it accepts.
    pub name: String,
    pub listen_addr: SocketAddr,
    /// Hostname advertised in the greeting and EHLO response.
    pub hostname: String,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    #[serde(default)]
    pub authentication: bool,
    /// Extension names left out of the EHLO response.
    #[serde(default)]
    pub hidden_extensions: Vec<String>,
    #[serde(default)]
    pub dkim_hash_algo: HashAlgorithm,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl InterfaceConfig {
    pub fn named(name: &str, listen_addr: SocketAddr, hostname: &str) -> Self {
        Self {
            name: name.to_string(),
            listen_addr,
            hostname: hostname.to_string(),
            max_size: default_max_size(),
            max_recipients: default_max_recipients(),
            authentication: false,
            hidden_extensions: Vec::new(),
            dkim_hash_algo: HashAlgorithm::default(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Wrap the socket immediately (smtps); otherwise offer STARTTLS.
    #[serde(default)]
    pub implicit: bool,
    pub cert: TlsMaterial,
    pub key: TlsMaterial,
}

/// PEM material source. Resolution order: environment variable, inline
/// PEM, file path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsMaterial {
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub pem: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl TlsMaterial {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn resolve(&self) -> std::io::Result<Vec<u8>> {
        if let Some(var) = &self.env
            && let Ok(value) = std::env::var(var)
        {
            return Ok(value.into_bytes());
        }
        if let Some(pem) = &self.pem {
            return Ok(pem.clone().into_bytes());
        }
        if let Some(file) = &self.file {
            return std::fs::read(file);
        }
        Err(std::io::Error::other("no TLS material configured"))
    }
}

/// Everything a connection needs from its listener.
pub struct InterfaceContext {
    pub config: InterfaceConfig,
    pub hooks: Arc<HookBus>,
    pub queue: Arc<dyn Queue>,
    pub maildrop: Arc<MailDrop>,
    pub shutdown: CancellationToken,
}

impl InterfaceContext {
    pub fn starttls_available(&self) -> bool {
        self.config.tls.as_ref().is_some_and(|tls| !tls.implicit)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        domains::DomainConfigStore,
        hooks::{HookName, HookPayload, NamedHook},
        pipeline::collect,
        queue::{ShiftOptions, memory::MemoryQueue},
        response::SmtpResponse,
        router::{Router, RoutingTables},
        smtp::connection,
    };
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    fn context(hooks: HookBus, mutate: impl FnOnce(&mut InterfaceConfig)) -> (Arc<InterfaceContext>, Arc<MemoryQueue>) {
        let router = Arc::new(Router::new(RoutingTables {
            default_zone: Some("default".to_string()),
            ..Default::default()
        }));
        let queue = Arc::new(MemoryQueue::new(router.clone()));
        let hooks = Arc::new(hooks);
        let maildrop = Arc::new(MailDrop::new(
            queue.clone(),
            hooks.clone(),
            router,
            "mx.test.example".to_string(),
        ));

        let mut config = InterfaceConfig::named(
            "feeder",
            "127.0.0.1:2525".parse().unwrap(),
            "mx.test.example",
        );
        mutate(&mut config);

        let context = Arc::new(InterfaceContext {
            config,
            hooks,
            queue: queue.clone(),
            maildrop,
            shutdown: CancellationToken::new(),
        });
        (context, queue)
    }

    struct Exchange {
        client: tokio::io::DuplexStream,
        read_buffer: Vec<u8>,
    }

    impl Exchange {
        fn start(context: Arc<InterfaceContext>) -> Self {
            let (client, mut server) = tokio::io::duplex(16 * 1024);
            tokio::spawn(async move {
                let peer: std::net::SocketAddr = "192.0.2.9:51000".parse().unwrap();
                let _ = connection::handle(&mut server, context, peer, None, true).await;
            });
            Self {
                client,
                read_buffer: Vec::new(),
            }
        }

        /// Read one complete (possibly multiline) reply, returning its code.
        async fn read_reply(&mut self) -> (u16, String) {
            let mut reply = String::new();
            loop {
                // read until we hold a full line
                while !self.read_buffer.contains(&b'\n') {
                    let mut chunk = [0u8; 1024];
                    let n = self.client.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed while waiting for a reply");
                    self.read_buffer.extend_from_slice(&chunk[..n]);
                }
                let split = self.read_buffer.iter().position(|&b| b == b'\n').unwrap() + 1;
                let line: Vec<u8> = self.read_buffer.drain(..split).collect();
                let line = String::from_utf8(line).unwrap();
                reply.push_str(&line);

                // "250-" continues, "250 " ends the reply
                if line.len() < 4 || line.as_bytes()[3] != b'-' {
                    let code = line[..3].parse().unwrap();
                    return (code, reply);
                }
            }
        }

        async fn send(&mut self, line: &str) {
            self.client.write_all(line.as_bytes()).await.unwrap();
            self.client.write_all(b"\r\n").await.unwrap();
        }

        async fn command(&mut self, line: &str) -> (u16, String) {
            self.send(line).await;
            self.read_reply().await
        }
    }

    fn shift_options() -> ShiftOptions {
        ShiftOptions {
            lock_owner: "test".to_string(),
            domain_config: Arc::new(DomainConfigStore::default()),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn submission_round_trip() {
        let (context, queue) = context(HookBus::new(), |_| {});
        let mut exchange = Exchange::start(context);

        assert_eq!(exchange.read_reply().await.0, 220);
        assert_eq!(exchange.command("EHLO client.example.com").await.0, 250);
        assert_eq!(exchange.command("MAIL FROM:<a@b.com>").await.0, 250);
        assert_eq!(exchange.command("RCPT TO:<c@d.com>").await.0, 250);
        assert_eq!(exchange.command("DATA").await.0, 354);

        exchange.send("Subject: t").await;
        exchange.send("").await;
        exchange.send("hello").await;
        let (code, reply) = exchange.command(".").await;
        assert_eq!(code, 250, "unexpected reply: {reply}");
        assert_eq!(exchange.command("QUIT").await.0, 221);

        let delivery = queue
            .shift("default", &shift_options())
            .await
            .unwrap()
            .expect("exactly one queued envelope");
        assert_eq!(delivery.recipient, "c@d.com");
        assert_eq!(delivery.envelope.from, "a@b.com");
        assert_eq!(delivery.envelope.interface, "feeder");
        assert_eq!(delivery.envelope.transhost, "client.example.com");
        assert_eq!(delivery.envelope.body_size, 7);

        let stored = collect(queue.retrieve(&delivery.id).await.unwrap())
            .await
            .unwrap();
        assert!(stored.ends_with(b"\r\n\r\nhello\r\n"), "stored body mismatch");
        assert!(queue
            .shift("default", &shift_options())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn recipient_limit_yields_452() {
        let (context, _queue) = context(HookBus::new(), |config| config.max_recipients = 2);
        let mut exchange = Exchange::start(context);

        exchange.read_reply().await;
        exchange.command("EHLO client.example.com").await;
        exchange.command("MAIL FROM:<a@b.com>").await;
        assert_eq!(exchange.command("RCPT TO:<one@d.com>").await.0, 250);
        assert_eq!(exchange.command("RCPT TO:<two@d.com>").await.0, 250);
        assert_eq!(exchange.command("RCPT TO:<three@d.com>").await.0, 452);
    }

    #[tokio::test]
    async fn invalid_recipient_yields_553() {
        let (context, _queue) = context(HookBus::new(), |_| {});
        let mut exchange = Exchange::start(context);

        exchange.read_reply().await;
        exchange.command("EHLO client.example.com").await;
        exchange.command("MAIL FROM:<a@b.com>").await;
        assert_eq!(exchange.command("RCPT TO:<x@>").await.0, 553);
    }

    #[tokio::test]
    #[traced_test]
    async fn oversized_message_yields_552_after_data() {
        let (context, queue) = context(HookBus::new(), |config| config.max_size = 64);
        let mut exchange = Exchange::start(context);

        exchange.read_reply().await;
        exchange.command("EHLO client.example.com").await;
        exchange.command("MAIL FROM:<a@b.com>").await;
        exchange.command("RCPT TO:<c@d.com>").await;
        assert_eq!(exchange.command("DATA").await.0, 354);

        exchange.send("Subject: big").await;
        exchange.send("").await;
        exchange.send(&"x".repeat(200)).await;
        assert_eq!(exchange.command(".").await.0, 552);

        // nothing may survive in the queue
        assert!(queue
            .shift("default", &shift_options())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn commands_require_hello_and_mail_ordering() {
        let (context, _queue) = context(HookBus::new(), |_| {});
        let mut exchange = Exchange::start(context);

        exchange.read_reply().await;
        assert_eq!(exchange.command("MAIL FROM:<a@b.com>").await.0, 503);
        exchange.command("EHLO client.example.com").await;
        assert_eq!(exchange.command("RCPT TO:<c@d.com>").await.0, 503);
        assert_eq!(exchange.command("DATA").await.0, 503);
    }

    struct StaticCredentials;

    #[async_trait]
    impl NamedHook for StaticCredentials {
        async fn call(&self, payload: &mut HookPayload<'_>) -> Result<(), SmtpResponse> {
            let HookPayload::Auth { username, password } = payload else {
                return Ok(());
            };
            if *username == "john" && *password == "p4ssw0rd" {
                Ok(())
            } else {
                Err(SmtpResponse::new(535, "5.7.8 Authentication credentials invalid"))
            }
        }
    }

    #[tokio::test]
    async fn auth_plain_via_hook() {
        let mut hooks = HookBus::new();
        hooks.add_hook(HookName::SmtpAuth, Arc::new(StaticCredentials));
        let (context, _queue) = context(hooks, |config| config.authentication = true);
        let mut exchange = Exchange::start(context);

        exchange.read_reply().await;
        let (_, ehlo) = exchange.command("EHLO client.example.com").await;
        assert!(ehlo.contains("AUTH"), "EHLO should advertise AUTH: {ehlo}");

        // "\0john\0p4ssw0rd"
        assert_eq!(
            exchange.command("AUTH PLAIN AGpvaG4AcDRzc3cwcmQ=").await.0,
            235
        );
    }

    #[tokio::test]
    async fn auth_plain_rejection() {
        let mut hooks = HookBus::new();
        hooks.add_hook(HookName::SmtpAuth, Arc::new(StaticCredentials));
        let (context, _queue) = context(hooks, |config| config.authentication = true);
        let mut exchange = Exchange::start(context);

        exchange.read_reply().await;
        exchange.command("EHLO client.example.com").await;
        // "\0john\0wrong"
        assert_eq!(
            exchange.command("AUTH PLAIN AGpvaG4Ad3Jvbmc=").await.0,
            535
        );
    }

    #[tokio::test]
    async fn tls_material_resolution_order() {
        let material = TlsMaterial {
            env: Some("MAILZONE_TEST_TLS_PEM".to_string()),
            pem: Some("inline".to_string()),
            file: None,
        };

        // no env var set: inline PEM wins
        unsafe { std::env::remove_var("MAILZONE_TEST_TLS_PEM") };
        assert_eq!(material.resolve().unwrap(), b"inline");

        unsafe { std::env::set_var("MAILZONE_TEST_TLS_PEM", "from-env") };
        assert_eq!(material.resolve().unwrap(), b"from-env");
        unsafe { std::env::remove_var("MAILZONE_TEST_TLS_PEM") };

        assert!(TlsMaterial::default().resolve().is_err());
    }
}
