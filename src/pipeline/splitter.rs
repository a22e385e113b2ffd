use crate::{
    headers::Headers,
    pipeline::{ByteStream, EventStream, encoding::TransferEncoding},
};
use async_stream::try_stream;
use bytes::Bytes;
use futures::StreamExt;

/// A structured token of the MIME stream. The concatenation of all events,
/// serialized in order, reproduces the wire form of the message.
#[derive(Debug, Clone)]
pub enum MimeEvent {
    /// The header block of the root message or of a nested part.
    Node(MimeNode),
    /// Raw body bytes belonging to the given node, line endings included.
    Body { node: usize, data: Bytes },
    /// A multipart boundary marker line, passed through verbatim.
    Boundary(Bytes),
}

#[derive(Debug, Clone)]
pub struct MimeNode {
    pub id: usize,
    pub root: bool,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub boundary: Option<String>,
    pub encoding: TransferEncoding,
}

impl MimeNode {
    fn from_headers(id: usize, root: bool, headers: Headers) -> Self {
        let content_type = headers.get_first("content-type");
        let (content_type, boundary) = match content_type {
            Some(value) => {
                let mut parts = value.split(';');
                let mime_type = parts
                    .next()
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty());
                let boundary = parts.filter_map(parse_boundary_param).next();
                (mime_type, boundary)
            }
            None => (None, None),
        };

        let encoding = headers
            .get_first("content-transfer-encoding")
            .map(|value| TransferEncoding::parse(&value))
            .unwrap_or_default();

        Self {
            id,
            root,
            headers,
            content_type,
            boundary,
            encoding,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|t| t.starts_with("multipart/"))
            && self.boundary.is_some()
    }
}

fn parse_boundary_param(param: &str) -> Option<String> {
    let (key, value) = param.split_once('=')?;
    if !key.trim().eq_ignore_ascii_case("boundary") {
        return None;
    }
    Some(value.trim().trim_matches('"').to_string())
}

enum State {
    Header { root: bool },
    Body,
}

/// Line-oriented splitter state machine. Fed chunks of arbitrary size, it
/// buffers at most one partial line.
struct Splitter {
    state: State,
    pending: Vec<u8>,
    header_block: Vec<u8>,
    // innermost boundary last; a node id per open multipart
    boundaries: Vec<(String, usize)>,
    node_seq: usize,
    current_node: usize,
}

impl Splitter {
    fn new() -> Self {
        Self {
            state: State::Header { root: true },
            pending: Vec::new(),
            header_block: Vec::new(),
            boundaries: Vec::new(),
            node_seq: 0,
            current_node: 0,
        }
    }

    fn push(&mut self, data: &[u8], events: &mut Vec<MimeEvent>) {
        self.pending.extend_from_slice(data);

        while let Some(pos) = find_line_end(&self.pending) {
            let line: Vec<u8> = self.pending.drain(..pos).collect();
            self.take_line(&line, events);
        }
    }

    fn finish(&mut self, events: &mut Vec<MimeEvent>) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.take_line(&line, events);
        }
        if let State::Header { root } = self.state {
            // message ended inside a header block
            self.emit_node(root, events);
        }
    }

    fn take_line(&mut self, line: &[u8], events: &mut Vec<MimeEvent>) {
        match self.state {
            State::Header { root } => {
                if line == b"\r\n" || line == b"\n" {
                    self.emit_node(root, events);
                    self.state = State::Body;
                } else {
                    self.header_block.extend_from_slice(line);
                }
            }
            State::Body => {
                if let Some(level) = self.match_boundary(line) {
                    let closing = is_closing_boundary(line);
                    events.push(MimeEvent::Boundary(Bytes::copy_from_slice(line)));

                    self.boundaries.truncate(level + 1);
                    if closing {
                        let (_, owner) = self.boundaries.pop().unwrap();
                        self.current_node = owner;
                    } else {
                        self.state = State::Header { root: false };
                    }
                } else {
                    events.push(MimeEvent::Body {
                        node: self.current_node,
                        data: Bytes::copy_from_slice(line),
                    });
                }
            }
        }
    }

    fn emit_node(&mut self, root: bool, events: &mut Vec<MimeEvent>) {
        let headers = Headers::parse(&std::mem::take(&mut self.header_block));
        let node = MimeNode::from_headers(self.node_seq, root, headers);
        self.current_node = node.id;
        self.node_seq += 1;

        if node.is_multipart() {
            self.boundaries
                .push((node.boundary.clone().unwrap(), node.id));
        }

        events.push(MimeEvent::Node(node));
        self.state = State::Body;
    }

    /// Match against open boundaries, outermost wins on conflict so that a
    /// malformed nested part cannot swallow its parent's terminator.
    fn match_boundary(&self, line: &[u8]) -> Option<usize> {
        let text = std::str::from_utf8(line).ok()?.trim_end();
        let marker = text.strip_prefix("--")?;

        self.boundaries.iter().position(|(boundary, _)| {
            marker == boundary.as_str() || marker == format!("{boundary}--")
        })
    }
}

fn is_closing_boundary(line: &[u8]) -> bool {
    std::str::from_utf8(line)
        .map(|text| text.trim_end().ends_with("--"))
        .unwrap_or(false)
}

fn find_line_end(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n').map(|p| p + 1)
}

/// Split a raw message stream into MIME events.
pub fn split(mut upstream: ByteStream) -> EventStream {
    Box::pin(try_stream! {
        let mut splitter = Splitter::new();
        let mut events = Vec::new();

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            splitter.push(&chunk, &mut events);
            for event in events.drain(..) {
                yield event;
            }
        }

        splitter.finish(&mut events);
        for event in events.drain(..) {
            yield event;
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::stream_from;

    async fn split_all(raw: &str) -> Vec<MimeEvent> {
        split(stream_from(raw.as_bytes().to_vec()))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn parses_content_type_params() {
        let headers = Headers::parse(
            b"Content-Type: multipart/mixed; boundary=\"b1\"\r\nContent-Transfer-Encoding: base64\r\n",
        );
        let node = MimeNode::from_headers(0, true, headers);
        assert_eq!(node.content_type.as_deref(), Some("multipart/mixed"));
        assert_eq!(node.boundary.as_deref(), Some("b1"));
        assert_eq!(node.encoding, TransferEncoding::Base64);
        assert!(node.is_multipart());
    }

    #[tokio::test]
    async fn splits_simple_message() {
        let events = split_all("Subject: t\r\n\r\nhello\r\n").await;

        assert_eq!(events.len(), 2);
        let MimeEvent::Node(node) = &events[0] else {
            panic!("expected node first");
        };
        assert!(node.root);
        assert_eq!(node.headers.get_first("subject").as_deref(), Some("t"));

        let MimeEvent::Body { node: owner, data } = &events[1] else {
            panic!("expected body");
        };
        assert_eq!(*owner, node.id);
        assert_eq!(data.as_ref(), b"hello\r\n");
    }

    #[tokio::test]
    async fn splits_nested_multipart() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=outer\r\n\r\n",
            "--outer\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "part one\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=inner\r\n\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n\r\n",
            "<p>hi</p>\r\n",
            "--inner--\r\n",
            "--outer--\r\n",
        );

        let events = split_all(raw).await;

        let nodes: Vec<&MimeNode> = events
            .iter()
            .filter_map(|e| match e {
                MimeEvent::Node(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(nodes.len(), 4);
        assert!(nodes[0].root && nodes[0].is_multipart());
        assert_eq!(nodes[2].content_type.as_deref(), Some("multipart/alternative"));
        assert_eq!(nodes[3].content_type.as_deref(), Some("text/html"));

        let boundaries = events
            .iter()
            .filter(|e| matches!(e, MimeEvent::Boundary(_)))
            .count();
        assert_eq!(boundaries, 5);
    }

    #[tokio::test]
    async fn missing_close_boundary_is_tolerated() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n\r\n",
            "--b\r\n",
            "\r\n",
            "text\r\n",
        );
        let events = split_all(raw).await;
        // root node, boundary, child node, body
        assert_eq!(events.len(), 4);
    }
}
