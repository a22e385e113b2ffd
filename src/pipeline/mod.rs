use crate::response::SmtpResponse;
use bytes::Bytes;
use futures::Stream;
use std::{io, pin::Pin};
use thiserror::Error;

pub mod dkim;
pub mod encoding;
pub mod limits;
pub mod parser;
pub mod splitter;

/// Failure of a streaming stage. A `Response` carries an SMTP reply the
/// ingress hands to the client as-is; `Io` maps to a generic 451.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stream failed: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Response(#[from] SmtpResponse),
}

/// A chunked byte stream flowing between pipeline stages. Back-pressure is
/// inherent: a stage does not see the next chunk before it has yielded.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send + 'static>>;

/// A structured MIME event stream between the splitter and the joiner.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<splitter::MimeEvent, PipelineError>> + Send + 'static>>;

/// Lift a byte buffer into a single-chunk stream, mostly for tests and
/// locally generated messages.
pub fn stream_from(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

#[cfg(test)]
pub(crate) async fn collect(mut stream: ByteStream) -> Result<Vec<u8>, PipelineError> {
    use futures::StreamExt;

    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
