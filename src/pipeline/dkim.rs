use crate::pipeline::ByteStream;
use async_stream::try_stream;
use aws_lc_rs::digest::{self, Context, SHA1_FOR_LEGACY_USE_ONLY, SHA256};
use base64ct::{Base64, Encoding};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::trace;

/// Body hash algorithm selected by the envelope's DKIM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha1,
}

impl HashAlgorithm {
    fn digest(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha256 => &SHA256,
            Self::Sha1 => &SHA1_FOR_LEGACY_USE_ONLY,
        }
    }
}

/// The "hash ready" payload fired once the message stream has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyHash {
    pub algorithm: HashAlgorithm,
    /// Base64 digest of the relaxed-canonicalized body.
    pub hash: String,
    /// Raw body bytes passed through, i.e. the stored body size.
    pub body_size: u64,
}

/// RFC 6376 relaxed body canonicalization, incremental. WSP runs collapse
/// to a single SP, trailing WSP per line is dropped, trailing empty lines
/// are dropped, and a non-empty body is terminated by exactly one CRLF.
struct RelaxedHasher {
    ctx: Context,
    line: Vec<u8>,
    held_newlines: u64,
    wrote_any: bool,
}

impl RelaxedHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            ctx: Context::new(algorithm.digest()),
            line: Vec::new(),
            held_newlines: 0,
            wrote_any: false,
        }
    }

    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.take_line(&line);
            } else {
                self.line.push(byte);
            }
        }
    }

    fn take_line(&mut self, line: &[u8]) {
        let canonical = canonical_line(line);
        if canonical.is_empty() {
            self.held_newlines += 1;
            return;
        }

        for _ in 0..self.held_newlines {
            self.ctx.update(b"\r\n");
        }
        self.held_newlines = 1;
        self.ctx.update(&canonical);
        self.wrote_any = true;
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.take_line(&line);
        }
        if self.wrote_any {
            self.ctx.update(b"\r\n");
        }
        self.ctx.finish().as_ref().to_vec()
    }
}

fn canonical_line(line: &[u8]) -> Vec<u8> {
    let line = match line {
        [rest @ .., b'\r'] => rest,
        _ => line,
    };

    let mut out = Vec::with_capacity(line.len());
    let mut pending_space = false;
    for &byte in line {
        if byte == b' ' || byte == b'\t' {
            pending_space = true;
        } else {
            if pending_space {
                out.push(b' ');
            }
            pending_space = false;
            out.push(byte);
        }
    }
    out
}

/// Pass-through stage that hashes everything after the header separator and
/// fires a single hash-ready signal when the stream ends.
pub fn body_hash(
    mut upstream: ByteStream,
    algorithm: HashAlgorithm,
) -> (ByteStream, oneshot::Receiver<BodyHash>) {
    let (sender, receiver) = oneshot::channel();

    let stream: ByteStream = Box::pin(try_stream! {
        let mut hasher = RelaxedHasher::new(algorithm);
        let mut body_size: u64 = 0;
        let mut in_body = false;
        // rolling tail of the last three header bytes, to spot the
        // CRLF CRLF separator across chunk borders
        let mut tail: Vec<u8> = Vec::with_capacity(3);

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;

            if !in_body {
                let mut window = tail.clone();
                window.extend_from_slice(&chunk);
                if let Some(pos) = window
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                {
                    in_body = true;
                    let body_start = pos + 4 - tail.len();
                    let body = &chunk[body_start..];
                    body_size += body.len() as u64;
                    hasher.update(body);
                } else {
                    let keep = window.len().min(3);
                    tail = window[window.len() - keep..].to_vec();
                }
            } else {
                body_size += chunk.len() as u64;
                hasher.update(&chunk);
            }

            yield chunk;
        }

        let hash = Base64::encode_string(&hasher.finish());
        trace!(body_size, hash, "body hash ready");
        let _ = sender.send(BodyHash {
            algorithm,
            hash,
            body_size,
        });
    });

    (stream, receiver)
}
