use crate::{
    pipeline::ByteStream,
    response::SmtpResponse,
};
use async_stream::try_stream;
use futures::StreamExt;
use std::time::Instant;
use tracing::debug;

/// Pass-through stage that counts bytes and records first-byte and finish
/// timestamps. Stats are logged once the stream completes.
pub fn byte_counter(mut upstream: ByteStream, label: &'static str) -> ByteStream {
    Box::pin(try_stream! {
        let started = Instant::now();
        let mut first_byte: Option<Instant> = None;
        let mut total: u64 = 0;

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            if first_byte.is_none() && !chunk.is_empty() {
                first_byte = Some(Instant::now());
            }
            total += chunk.len() as u64;
            yield chunk;
        }

        debug!(
            label,
            bytes = total,
            wait_ms = first_byte.map(|t| (t - started).as_millis() as u64),
            total_ms = started.elapsed().as_millis() as u64,
            "stream finished"
        );
    })
}

/// Pass-through stage with a size threshold. Data keeps flowing after the
/// threshold is crossed so the SMTP transaction can complete; the failure
/// surfaces as a single 552 once the client has finished sending.
pub fn size_limiter(mut upstream: ByteStream, max_size: u64) -> ByteStream {
    Box::pin(try_stream! {
        let mut total: u64 = 0;

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            yield chunk;
        }

        if total > max_size {
            debug!(bytes = total, max_size, "message exceeded size limit");
            Err(SmtpResponse::message_too_large(max_size))?;
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::{PipelineError, collect, stream_from};

    #[tokio::test]
    async fn counter_passes_data_through() {
        let stream = byte_counter(stream_from(&b"hello world"[..]), "test");
        assert_eq!(collect(stream).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn limiter_accepts_up_to_max() {
        let stream = size_limiter(stream_from(&b"12345"[..]), 5);
        assert_eq!(collect(stream).await.unwrap(), b"12345");
    }

    #[tokio::test]
    async fn limiter_drains_then_fails_with_552() {
        let stream = size_limiter(stream_from(&b"123456"[..]), 5);
        match collect(stream).await {
            Err(PipelineError::Response(response)) => assert_eq!(response.code, 552),
            other => panic!("expected 552, got {other:?}"),
        }
    }
}
