use crate::{
    envelope::Envelope,
    headers::Headers,
    pipeline::{ByteStream, EventStream, splitter::MimeEvent, splitter::MimeNode},
    response::SmtpResponse,
};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{collections::HashMap, fmt, net::IpAddr, sync::Arc};
use tokio::sync::mpsc;

/// Events a plugin can attach named callbacks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    SmtpConnect,
    SmtpAuth,
    SmtpMailFrom,
    SmtpRcptTo,
    SmtpData,
    MessageHeaders,
    MessageStore,
    MessageQueue,
    LogEntry,
}

impl HookName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SmtpConnect => "smtp:connect",
            Self::SmtpAuth => "smtp:auth",
            Self::SmtpMailFrom => "smtp:mail_from",
            Self::SmtpRcptTo => "smtp:rcpt_to",
            Self::SmtpData => "smtp:data",
            Self::MessageHeaders => "message:headers",
            Self::MessageStore => "message:store",
            Self::MessageQueue => "message:queue",
            Self::LogEntry => "log:entry",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable view handed to a named hook. Which variant shows up is implied
/// by the hook name the callback registered for.
pub enum HookPayload<'a> {
    Connect {
        remote: IpAddr,
        interface: &'a str,
    },
    Auth {
        username: &'a str,
        password: &'a str,
    },
    MailFrom {
        envelope: &'a mut Envelope,
    },
    RcptTo {
        envelope: &'a mut Envelope,
        recipient: &'a mut String,
    },
    Data {
        envelope: &'a mut Envelope,
    },
    MessageHeaders {
        envelope: &'a mut Envelope,
        headers: &'a mut Headers,
    },
    MessageStore {
        envelope: &'a mut Envelope,
    },
    MessageQueue {
        envelope: &'a mut Envelope,
    },
    LogEntry {
        code: &'a str,
        message: &'a str,
    },
}

/// A named hook callback. Errors short-circuit the remaining callbacks and
/// carry the SMTP reply the ingress should answer with.
#[async_trait]
pub trait NamedHook: Send + Sync {
    async fn call(&self, payload: &mut HookPayload<'_>) -> Result<(), SmtpResponse>;
}

/// Free-form transform applied to the raw message before splitting.
pub trait AnalyzerHook: Send + Sync {
    fn analyze(&self, input: ByteStream) -> ByteStream;
}

/// Per-node body transform. Qualifying nodes have their body decoded, run
/// through `rewrite`, and re-encoded with the node's transfer encoding; the
/// hook owns the returned stream and must drain its input to completion.
pub trait RewriteHook: Send + Sync {
    fn matches(&self, node: &MimeNode) -> bool;
    fn rewrite(&self, node: &MimeNode, decoded: ByteStream) -> ByteStream;
}

/// Read-only per-node observer, downstream of rewriting.
pub trait StreamHook: Send + Sync {
    fn observe(&self, node: &MimeNode) -> Option<Box<dyn NodeObserver>>;
}

#[async_trait]
pub trait NodeObserver: Send {
    async fn data(&mut self, chunk: &Bytes);
    async fn end(&mut self);
}

/// Ordered registry of all hook classes. Registration order within a hook
/// name defines invocation order.
#[derive(Default, Clone)]
pub struct HookBus {
    named: HashMap<HookName, Vec<Arc<dyn NamedHook>>>,
    analyzers: Vec<Arc<dyn AnalyzerHook>>,
    rewriters: Vec<Arc<dyn RewriteHook>>,
    streamers: Vec<Arc<dyn StreamHook>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, name: HookName, hook: Arc<dyn NamedHook>) {
        self.named.entry(name).or_default().push(hook);
    }

    pub fn add_analyzer(&mut self, hook: Arc<dyn AnalyzerHook>) {
        self.analyzers.push(hook);
    }

    pub fn add_rewriter(&mut self, hook: Arc<dyn RewriteHook>) {
        self.rewriters.push(hook);
    }

    pub fn add_streamer(&mut self, hook: Arc<dyn StreamHook>) {
        self.streamers.push(hook);
    }

    /// Run the named callbacks sequentially; the first error wins.
    pub async fn run(
        &self,
        name: HookName,
        payload: &mut HookPayload<'_>,
    ) -> Result<(), SmtpResponse> {
        if let Some(hooks) = self.named.get(&name) {
            for hook in hooks {
                hook.call(payload).await?;
            }
        }
        Ok(())
    }

    pub fn apply_analyzers(&self, stream: ByteStream) -> ByteStream {
        self.analyzers
            .iter()
            .fold(stream, |stream, hook| hook.analyze(stream))
    }

    pub fn apply_rewriters(&self, events: EventStream) -> EventStream {
        self.rewriters
            .iter()
            .cloned()
            .fold(events, |events, hook| rewrite_stage(events, hook))
    }

    pub fn apply_streamers(&self, events: EventStream) -> EventStream {
        if self.streamers.is_empty() {
            return events;
        }
        observer_stage(events, self.streamers.clone())
    }
}

/// State of the node currently being piped through a rewrite hook.
struct ActiveRewrite {
    node_id: usize,
    decoder: crate::pipeline::encoding::Decoder,
    input: mpsc::Sender<Bytes>,
    output: mpsc::UnboundedReceiver<Bytes>,
    task: tokio::task::JoinHandle<()>,
}

impl ActiveRewrite {
    fn start(hook: &Arc<dyn RewriteHook>, node: &MimeNode) -> Self {
        let (input, in_rx) = mpsc::channel::<Bytes>(4);
        let (out_tx, output) = mpsc::unbounded_channel();

        let decoded: ByteStream = Box::pin(async_stream::stream! {
            let mut in_rx = in_rx;
            while let Some(chunk) = in_rx.recv().await {
                yield Ok(chunk);
            }
        });

        let mut rewritten = hook.rewrite(node, decoded);
        let mut encoder = node.encoding.encoder();
        let task = tokio::spawn(async move {
            while let Some(chunk) = rewritten.next().await {
                let Ok(chunk) = chunk else { break };
                let encoded = encoder.update(&chunk);
                if !encoded.is_empty() && out_tx.send(Bytes::from(encoded)).is_err() {
                    return;
                }
            }
            let tail = encoder.finish();
            if !tail.is_empty() {
                let _ = out_tx.send(Bytes::from(tail));
            }
        });

        Self {
            node_id: node.id,
            decoder: node.encoding.decoder(),
            input,
            output,
            task,
        }
    }

    async fn push(&mut self, data: &[u8]) {
        let decoded = self.decoder.update(data);
        if !decoded.is_empty() {
            let _ = self.input.send(Bytes::from(decoded)).await;
        }
    }

    /// Close the input side and collect everything the hook still emits.
    async fn finish(mut self) -> Vec<Bytes> {
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            let _ = self.input.send(Bytes::from(tail)).await;
        }
        drop(self.input);

        let mut out = Vec::new();
        while let Some(chunk) = self.output.recv().await {
            out.push(chunk);
        }
        let _ = self.task.await;
        out
    }

    fn drain_ready(&mut self, out: &mut Vec<Bytes>) {
        while let Ok(chunk) = self.output.try_recv() {
            out.push(chunk);
        }
    }
}

fn rewrite_stage(mut events: EventStream, hook: Arc<dyn RewriteHook>) -> EventStream {
    Box::pin(try_stream! {
        let mut active: Option<ActiveRewrite> = None;
        let mut ready = Vec::new();

        while let Some(event) = events.next().await {
            let event = event?;

            // a new node or a boundary line terminates the rewritten body
            let ends_active = match &event {
                MimeEvent::Node(_) | MimeEvent::Boundary(_) => true,
                MimeEvent::Body { node, .. } => {
                    active.as_ref().is_some_and(|a| a.node_id != *node)
                }
            };
            if ends_active && let Some(rewrite) = active.take() {
                let node_id = rewrite.node_id;
                for data in rewrite.finish().await {
                    yield MimeEvent::Body { node: node_id, data };
                }
            }

            match event {
                MimeEvent::Node(node) => {
                    if hook.matches(&node) {
                        active = Some(ActiveRewrite::start(&hook, &node));
                    }
                    yield MimeEvent::Node(node);
                }
                MimeEvent::Body { node, data } => match active.as_mut() {
                    Some(rewrite) if rewrite.node_id == node => {
                        rewrite.push(&data).await;
                        rewrite.drain_ready(&mut ready);
                        for data in ready.drain(..) {
                            yield MimeEvent::Body { node, data };
                        }
                    }
                    _ => yield MimeEvent::Body { node, data },
                },
                MimeEvent::Boundary(data) => yield MimeEvent::Boundary(data),
            }
        }

        if let Some(rewrite) = active.take() {
            let node_id = rewrite.node_id;
            for data in rewrite.finish().await {
                yield MimeEvent::Body { node: node_id, data };
            }
        }
    })
}

fn observer_stage(mut events: EventStream, streamers: Vec<Arc<dyn StreamHook>>) -> EventStream {
    Box::pin(try_stream! {
        let mut observers: HashMap<usize, Vec<Box<dyn NodeObserver>>> = HashMap::new();

        while let Some(event) = events.next().await {
            let event = event?;

            match &event {
                MimeEvent::Node(node) => {
                    let watching: Vec<_> = streamers
                        .iter()
                        .filter_map(|s| s.observe(node))
                        .collect();
                    if !watching.is_empty() {
                        observers.insert(node.id, watching);
                    }
                }
                MimeEvent::Body { node, data } => {
                    if let Some(watching) = observers.get_mut(node) {
                        for observer in watching {
                            observer.data(data).await;
                        }
                    }
                }
                MimeEvent::Boundary(_) => {}
            }

            yield event;
        }

        for (_, watching) in observers.iter_mut() {
            for observer in watching {
                observer.end().await;
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::{collect, parser::{join, sync_headers}, splitter::split, stream_from};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Reject;

    #[async_trait]
    impl NamedHook for Reject {
        async fn call(&self, _: &mut HookPayload<'_>) -> Result<(), SmtpResponse> {
            Err(SmtpResponse::new(550, "5.7.1 No thanks"))
        }
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl NamedHook for Count {
        async fn call(&self, _: &mut HookPayload<'_>) -> Result<(), SmtpResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut bus = HookBus::new();
        bus.add_hook(HookName::SmtpConnect, Arc::new(Count(counter.clone())));
        bus.add_hook(HookName::SmtpConnect, Arc::new(Reject));
        bus.add_hook(HookName::SmtpConnect, Arc::new(Count(counter.clone())));

        let mut payload = HookPayload::Connect {
            remote: "127.0.0.1".parse().unwrap(),
            interface: "feeder",
        };
        let err = bus.run(HookName::SmtpConnect, &mut payload).await.unwrap_err();
        assert_eq!(err.code, 550);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    struct Upcase;

    impl RewriteHook for Upcase {
        fn matches(&self, node: &MimeNode) -> bool {
            node.content_type.as_deref() == Some("text/plain")
                || (node.root && node.content_type.is_none())
        }

        fn rewrite(&self, _node: &MimeNode, mut decoded: ByteStream) -> ByteStream {
            Box::pin(try_stream! {
                while let Some(chunk) = decoded.next().await {
                    let chunk = chunk?;
                    yield Bytes::from(chunk.to_ascii_uppercase());
                }
            })
        }
    }

    #[tokio::test]
    async fn rewrite_hook_transforms_matching_node() {
        let raw = "Subject: t\r\n\r\nhello\r\n";
        let mut bus = HookBus::new();
        bus.add_rewriter(Arc::new(Upcase));

        let events = bus.apply_rewriters(split(stream_from(raw.as_bytes().to_vec())));
        let out = collect(join(events, sync_headers(|_| Ok(())))).await.unwrap();
        assert_eq!(out, b"Subject: t\r\n\r\nHELLO\r\n");
    }

    #[tokio::test]
    async fn rewrite_hook_decodes_and_reencodes() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\nContent-Transfer-Encoding: base64\r\n\r\n",
            "aGVsbG8=\r\n",
            "--b--\r\n",
        );
        let mut bus = HookBus::new();
        bus.add_rewriter(Arc::new(Upcase));

        let events = bus.apply_rewriters(split(stream_from(raw.as_bytes().to_vec())));
        let out = collect(join(events, sync_headers(|_| Ok(())))).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        // HELLO, base64 encoded
        assert!(text.contains("SEVMTE8="), "unexpected output: {text}");
    }

    struct Collect(Arc<std::sync::Mutex<Vec<u8>>>);

    struct CollectObserver(Arc<std::sync::Mutex<Vec<u8>>>);

    impl StreamHook for Collect {
        fn observe(&self, node: &MimeNode) -> Option<Box<dyn NodeObserver>> {
            node.root.then(|| Box::new(CollectObserver(self.0.clone())) as Box<dyn NodeObserver>)
        }
    }

    #[async_trait]
    impl NodeObserver for CollectObserver {
        async fn data(&mut self, chunk: &Bytes) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }

        async fn end(&mut self) {}
    }

    #[tokio::test]
    async fn stream_hook_observes_without_changing_bytes() {
        let raw = "Subject: t\r\n\r\nhello\r\n";
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut bus = HookBus::new();
        bus.add_streamer(Arc::new(Collect(seen.clone())));

        let events = bus.apply_streamers(split(stream_from(raw.as_bytes().to_vec())));
        let out = collect(join(events, sync_headers(|_| Ok(())))).await.unwrap();

        assert_eq!(out, raw.as_bytes());
        assert_eq!(seen.lock().unwrap().as_slice(), b"hello\r\n");
    }
}
