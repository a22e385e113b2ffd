use crate::{
    headers::Headers,
    pipeline::{ByteStream, EventStream, splitter::MimeEvent},
    response::SmtpResponse,
};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{StreamExt, future::BoxFuture};

/// Invoked once with the root header block, before any body byte is
/// serialized. The callback may freely mutate the headers; an error aborts
/// the pipeline with the given SMTP reply.
pub type HeaderCallback =
    Box<dyn for<'a> FnMut(&'a mut Headers) -> BoxFuture<'a, Result<(), SmtpResponse>> + Send>;

/// Wrap a synchronous header mutation as a `HeaderCallback`.
pub fn sync_headers(
    mut f: impl FnMut(&mut Headers) -> Result<(), SmtpResponse> + Send + 'static,
) -> HeaderCallback {
    Box::new(move |headers| {
        let result = f(headers);
        let fut: BoxFuture<'_, Result<(), SmtpResponse>> = Box::pin(async move { result });
        fut
    })
}

/// Serialize MIME events back to the wire form of the message, headers
/// first. The header callback sees the root headers at their single
/// insertion point, before the CRLF CRLF separator is emitted.
pub fn join(mut events: EventStream, mut on_headers: HeaderCallback) -> ByteStream {
    Box::pin(try_stream! {
        while let Some(event) = events.next().await {
            match event? {
                MimeEvent::Node(mut node) => {
                    if node.root {
                        on_headers(&mut node.headers).await?;
                    }
                    let mut block = node.headers.to_bytes();
                    block.extend_from_slice(b"\r\n");
                    yield Bytes::from(block);
                }
                MimeEvent::Body { data, .. } => yield data,
                MimeEvent::Boundary(data) => yield data,
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::{PipelineError, collect, splitter::split, stream_from};

    #[tokio::test]
    async fn roundtrips_and_applies_header_callback() {
        let raw = "Subject: t\r\nTo: a@example.com\r\n\r\nhello\r\n";
        let events = split(stream_from(raw.as_bytes().to_vec()));

        let joined = join(
            events,
            sync_headers(|headers| {
                headers.prepend("Received", "from test by test; now");
                Ok(())
            }),
        );

        let out = collect(joined).await.unwrap();
        assert_eq!(
            out,
            b"Received: from test by test; now\r\nSubject: t\r\nTo: a@example.com\r\n\r\nhello\r\n"
        );
    }

    #[tokio::test]
    async fn callback_error_aborts_with_response() {
        let events = split(stream_from(&b"Subject: t\r\n\r\nbody\r\n"[..]));
        let joined = join(
            events,
            sync_headers(|_| Err(SmtpResponse::new(550, "5.7.1 Rejected by policy"))),
        );

        match collect(joined).await {
            Err(PipelineError::Response(response)) => assert_eq!(response.code, 550),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multipart_structure_survives_the_roundtrip() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n\r\n",
            "preamble\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "part\r\n",
            "--b--\r\n",
            "epilogue\r\n",
        );

        let joined = join(split(stream_from(raw.as_bytes().to_vec())), sync_headers(|_| Ok(())));
        assert_eq!(collect(joined).await.unwrap(), raw.as_bytes());
    }
}
