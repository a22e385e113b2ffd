use bytes::Bytes;
use smtp_proto::Request;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, trace};

use crate::{
    envelope::TlsInfo,
    hooks::{HookName, HookPayload},
    pipeline::{ByteStream, PipelineError, limits},
    smtp::InterfaceContext,
    smtp::session::{AuthIngest, SessionReply, SmtpSession},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("connection idle too long")]
    Timeout,
}

/// Why `handle` returned: the session is over, or the client asked for a
/// TLS handshake and the caller owns the socket upgrade.
pub enum ConnectionOutcome {
    Done,
    UpgradeTls,
}

const COMMAND_LINE_CAP: u64 = 1024;
const DATA_LINE_CAP: u64 = 64 * 1024;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub async fn handle(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    context: Arc<InterfaceContext>,
    peer_addr: SocketAddr,
    tls: Option<TlsInfo>,
    greet: bool,
) -> Result<ConnectionOutcome, ConnectionError> {
    let (source, mut sink) = tokio::io::split(stream);
    let mut reader = BufReader::new(source);
    let mut buffer = Vec::with_capacity(COMMAND_LINE_CAP as usize);

    let mut session = SmtpSession::new(context.clone(), peer_addr, tls);
    trace!("handling connection with {}", session.peer());

    if greet {
        if let Err(response) = context
            .hooks
            .run(
                HookName::SmtpConnect,
                &mut HookPayload::Connect {
                    remote: peer_addr.ip(),
                    interface: &context.config.name,
                },
            )
            .await
        {
            write_reply(response.code, &response.text, &mut sink).await?;
            return Ok(ConnectionOutcome::Done);
        }

        write_reply(
            220,
            &format!("{} ESMTP Mailzone ready", context.config.hostname),
            &mut sink,
        )
        .await?;
    }

    'session: loop {
        read_line(&mut reader, &mut buffer, COMMAND_LINE_CAP).await?;
        let request = Request::parse(&mut buffer.iter()).map(|r| r.into_owned());

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut sink).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                break;
            }
            SessionReply::RawReply(buf) => {
                sink.write_all(&buf).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::UpgradeTls(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                return Ok(ConnectionOutcome::UpgradeTls);
            }
            SessionReply::IngestAuth(code, message, ingest) => {
                write_reply(code, &message, &mut sink).await?;
                read_line(&mut reader, &mut buffer, COMMAND_LINE_CAP).await?;
                if buffer.trim_ascii_end() == b"*".as_slice() {
                    write_reply(501, "5.5.2 Authentication aborted", &mut sink).await?;
                    continue;
                }

                let (code, message) = match ingest {
                    AuthIngest::Plain => session.handle_plain_auth(&mut buffer).await,
                    AuthIngest::LoginUsername => {
                        let username = buffer.clone();
                        // "Password:"
                        write_reply(334, "UGFzc3dvcmQ6", &mut sink).await?;
                        read_line(&mut reader, &mut buffer, COMMAND_LINE_CAP).await?;
                        session.handle_login_auth(&username, &buffer).await
                    }
                };
                write_reply(code, &message, &mut sink).await?;
            }
            SessionReply::IngestData(code, message) => {
                let Some(envelope) = session.take_envelope() else {
                    write_reply(503, "5.5.1 Bad sequence of commands", &mut sink).await?;
                    continue;
                };
                write_reply(code, &message, &mut sink).await?;

                let (tx, rx) = mpsc::channel::<Result<Bytes, PipelineError>>(8);
                let data_stream: ByteStream = Box::pin(async_stream::stream! {
                    let mut rx = rx;
                    while let Some(item) = rx.recv().await {
                        yield item;
                    }
                });
                let limited = limits::size_limiter(data_stream, context.config.max_size);

                let maildrop = context.maildrop.clone();
                let accept = tokio::spawn(async move { maildrop.add(envelope, limited).await });

                // line-oriented DATA phase: unstuff dots, stop at the
                // bare-dot terminator
                let mut at_line_start = true;
                loop {
                    match read_line(&mut reader, &mut buffer, DATA_LINE_CAP).await {
                        Ok(_) => {}
                        Err(err) => {
                            // error the pipeline so the mail drop tears the
                            // partial artifact down on its own
                            let _ = tx
                                .send(Err(PipelineError::Io(std::io::Error::other(
                                    "client vanished during DATA",
                                ))))
                                .await;
                            drop(tx);
                            return Err(err);
                        }
                    }

                    let line: &[u8] = if at_line_start && buffer.starts_with(b".") {
                        if buffer == b".\r\n" || buffer == b".\n" {
                            break;
                        }
                        &buffer[1..]
                    } else {
                        &buffer
                    };
                    at_line_start = buffer.ends_with(b"\n");

                    if tx.send(Ok(Bytes::copy_from_slice(line))).await.is_err() {
                        // pipeline already failed; keep draining the client
                        // so the protocol can finish with a clean reply
                        continue;
                    }
                }
                drop(tx);

                let response = match accept.await {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => err.response(),
                    Err(join_err) => {
                        debug!("mail drop task failed: {join_err}");
                        crate::response::SmtpResponse::service_unavailable()
                    }
                };
                write_reply(response.code, &response.text, &mut sink).await?;
                continue 'session;
            }
        }
    }

    info!("connection with {} finished", peer_addr);
    Ok(ConnectionOutcome::Done)
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    cap: u64,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    let read = timeout(SOCKET_TIMEOUT, reader.take(cap).read_until(b'\n', buffer))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)?;

    if read == 0 {
        return Err(ConnectionError::Dropped);
    }
    Ok(read)
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    sink.write_all(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    debug!("sent: {code} {message}");
    Ok(())
}
