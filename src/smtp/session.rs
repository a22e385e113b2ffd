use base64ct::{Base64, Encoding};
use email_address::EmailAddress;
use smtp_proto::{
    AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING,
    EXT_SIZE, EXT_SMTP_UTF8, EXT_START_TLS, EhloResponse, Request,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, info, trace};

use crate::{
    address,
    envelope::{Envelope, TlsInfo},
    hooks::{HookName, HookPayload},
    response::SmtpResponse,
    smtp::InterfaceContext,
};

const AUTH_CREDENTIAL_CAP: usize = 1024;

pub struct SmtpSession {
    context: Arc<InterfaceContext>,
    peer_addr: SocketAddr,
    /// HELO/EHLO hostname plus whether the client spoke ESMTP.
    helo: Option<(String, bool)>,
    user: Option<String>,
    tls: Option<TlsInfo>,
    envelope: Option<Envelope>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String, AuthIngest),
    /// Reply, then hand the socket back for a TLS handshake.
    UpgradeTls(u16, String),
}

/// What the connection loop should collect next during an AUTH exchange.
#[derive(Clone, Copy)]
pub enum AuthIngest {
    Plain,
    LoginUsername,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Say EHLO or HELO first";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_NO_VALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_FAILED: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTH_LINE_TOO_LONG: &str = "5.5.6 Authentication exchange line is too long";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_TLS_UNAVAILABLE: &str = "4.7.0 TLS not available";
    const RESPONSE_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";

    pub fn new(
        context: Arc<InterfaceContext>,
        peer_addr: SocketAddr,
        tls: Option<TlsInfo>,
    ) -> Self {
        Self {
            context,
            peer_addr,
            helo: None,
            user: None,
            tls,
            envelope: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// SMTP, ESMTP, plus S for TLS and A for an authenticated session.
    fn transtype(&self) -> String {
        let esmtp = self.helo.as_ref().is_some_and(|(_, esmtp)| *esmtp);
        let mut transtype = String::from(if esmtp { "ESMTP" } else { "SMTP" });
        if self.tls.is_some() {
            transtype.push('S');
        }
        if self.user.is_some() {
            transtype.push('A');
        }
        transtype
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                debug!("failed to parse request: {err}");
                return SessionReply::ReplyAndContinue(500, err.to_string());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // the Debug form of an AUTH request would print credentials
            trace!("received AUTH with mechanism {mechanism} from {}", self.peer_addr);
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        if self.context.shutdown.is_cancelled() {
            let response = SmtpResponse::shutting_down();
            return SessionReply::ReplyAndStop(response.code, response.text);
        }

        match request {
            Request::Ehlo { host } => {
                self.helo = Some((host.clone(), true));
                SessionReply::RawReply(self.ehlo_response(&host))
            }
            Request::Helo { host } => {
                self.helo = Some((host, false));
                SessionReply::ReplyAndContinue(
                    250,
                    format!("{} at your service", self.context.config.hostname),
                )
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
            }
            Request::StartTls => {
                if self.tls.is_some() {
                    return SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into());
                }
                if !self.context.starttls_available() {
                    return SessionReply::ReplyAndContinue(
                        454,
                        Self::RESPONSE_TLS_UNAVAILABLE.into(),
                    );
                }
                SessionReply::UpgradeTls(220, "2.0.0 Ready to start TLS".into())
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => {
                if self.user.is_some() {
                    return SessionReply::ReplyAndContinue(
                        503,
                        Self::RESPONSE_ALREADY_AUTHENTICATED.into(),
                    );
                }

                match mechanism {
                    AUTH_PLAIN => {
                        if initial_response.is_empty() {
                            return SessionReply::IngestAuth(334, String::new(), AuthIngest::Plain);
                        }
                        let (code, message) =
                            self.handle_plain_auth(&mut initial_response.into_bytes()).await;
                        SessionReply::ReplyAndContinue(code, message)
                    }
                    AUTH_LOGIN => SessionReply::IngestAuth(
                        334,
                        // "Username:"
                        "VXNlcm5hbWU6".into(),
                        AuthIngest::LoginUsername,
                    ),
                    _ => {
                        debug!("received unsupported AUTH mechanism");
                        SessionReply::ReplyAndContinue(504, Self::RESPONSE_AUTH_FAILED.into())
                    }
                }
            }
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            Request::Noop { value: _ } => {
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Rset => {
                self.envelope = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            // everything below needs a hello first
            _ignored if self.helo.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => self.handle_mail_from(from.address).await,
            Request::Rcpt { to } => self.handle_rcpt_to(to.address).await,
            Request::Data => {
                let Some(envelope) = self.envelope.as_mut() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };
                if envelope.to.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        554,
                        Self::RESPONSE_NO_VALID_RECIPIENTS.into(),
                    );
                }

                if let Err(response) = self
                    .context
                    .hooks
                    .run(HookName::SmtpData, &mut HookPayload::Data { envelope })
                    .await
                {
                    return SessionReply::ReplyAndContinue(response.code, response.text);
                }

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Vrfy { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Bdat { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
            }
        }
    }

    fn ehlo_response(&self, host: &str) -> Vec<u8> {
        let config = &self.context.config;
        let mut response = EhloResponse::new(config.hostname.as_str());

        let mut capabilities =
            EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8 | EXT_PIPELINING | EXT_SIZE;
        if self.context.starttls_available() && self.tls.is_none() {
            capabilities |= EXT_START_TLS;
        }
        if config.authentication {
            capabilities |= EXT_AUTH;
            response.auth_mechanisms = AUTH_PLAIN | AUTH_LOGIN;
        }
        for hidden in &config.hidden_extensions {
            capabilities &= !match hidden.to_ascii_uppercase().as_str() {
                "PIPELINING" => EXT_PIPELINING,
                "8BITMIME" => EXT_8BIT_MIME,
                "SMTPUTF8" => EXT_SMTP_UTF8,
                "SIZE" => EXT_SIZE,
                _ => 0,
            };
        }
        response.capabilities = capabilities;
        response.size = config.max_size as usize;

        trace!("EHLO from {host}");

        let mut buf = Vec::with_capacity(128);
        response.write(&mut buf).ok();
        buf
    }

    async fn handle_mail_from(&mut self, from: String) -> SessionReply {
        debug!("received MAIL FROM: {from}");

        if self.envelope.is_some() {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
        }

        // the null return path of bounces stays empty
        let sender = match from.is_empty() {
            true => String::new(),
            false => {
                let normalized = address::normalize(&from);
                if normalized.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                }
                normalized
            }
        };

        let id = match self.context.queue.next_id().await {
            Ok(id) => id,
            Err(err) => {
                debug!("could not obtain envelope id: {err}");
                let response = SmtpResponse::service_unavailable();
                return SessionReply::ReplyAndContinue(response.code, response.text);
            }
        };

        let mut envelope = Envelope::new(id, self.context.config.name.clone(), self.peer_addr.ip());
        envelope.from = sender;
        envelope.transhost = self
            .helo
            .as_ref()
            .map(|(host, _)| host.clone())
            .unwrap_or_default();
        envelope.transtype = self.transtype();
        envelope.user = self.user.clone().unwrap_or_default();
        envelope.tls = self.tls.clone();
        envelope.dkim.hash_algo = self.context.config.dkim_hash_algo;

        if let Err(response) = self
            .context
            .hooks
            .run(
                HookName::SmtpMailFrom,
                &mut HookPayload::MailFrom {
                    envelope: &mut envelope,
                },
            )
            .await
        {
            return SessionReply::ReplyAndContinue(response.code, response.text);
        }

        let reply = format!("2.1.0 Originator <{}> ok", envelope.from);
        self.envelope = Some(envelope);
        SessionReply::ReplyAndContinue(250, reply)
    }

    async fn handle_rcpt_to(&mut self, to: String) -> SessionReply {
        debug!("received RCPT TO: {to}");

        let Some(envelope) = self.envelope.as_mut() else {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
        };

        if envelope.to.len() >= self.context.config.max_recipients {
            let response = SmtpResponse::too_many_recipients();
            return SessionReply::ReplyAndContinue(response.code, response.text);
        }

        if !is_valid_recipient(&to) {
            let response = SmtpResponse::bad_recipient(&to);
            return SessionReply::ReplyAndContinue(response.code, response.text);
        }

        let mut recipient = address::normalize(&to);
        if recipient.is_empty() {
            let response = SmtpResponse::bad_recipient(&to);
            return SessionReply::ReplyAndContinue(response.code, response.text);
        }

        if let Err(response) = self
            .context
            .hooks
            .run(
                HookName::SmtpRcptTo,
                &mut HookPayload::RcptTo {
                    envelope,
                    recipient: &mut recipient,
                },
            )
            .await
        {
            return SessionReply::ReplyAndContinue(response.code, response.text);
        }

        let reply = format!("2.1.5 Recipient <{recipient}> ok");
        envelope.add_recipient(recipient);
        SessionReply::ReplyAndContinue(250, reply)
    }

    pub async fn handle_plain_auth(&mut self, data: &mut [u8]) -> (u16, String) {
        let Some((username, password)) = decode_plain_auth(data) else {
            return (501, Self::RESPONSE_SYNTAX_ERROR.into());
        };
        self.authenticate(&username, &password).await
    }

    pub async fn handle_login_auth(
        &mut self,
        username_b64: &[u8],
        password_b64: &[u8],
    ) -> (u16, String) {
        let (Some(username), Some(password)) = (
            decode_base64_line(username_b64),
            decode_base64_line(password_b64),
        ) else {
            return (501, Self::RESPONSE_SYNTAX_ERROR.into());
        };
        self.authenticate(&username, &password).await
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> (u16, String) {
        if username.len() > AUTH_CREDENTIAL_CAP || password.len() > AUTH_CREDENTIAL_CAP {
            return (500, Self::RESPONSE_AUTH_LINE_TOO_LONG.into());
        }

        let result = self
            .context
            .hooks
            .run(
                HookName::SmtpAuth,
                &mut HookPayload::Auth { username, password },
            )
            .await;

        match result {
            Ok(()) => {
                info!(code = "AUTHSUCCESS", username, peer = %self.peer_addr, "authenticated");
                self.user = Some(username.to_string());
                (235, "2.7.0 Authentication succeeded".into())
            }
            Err(response) => {
                info!(code = "AUTHFAIL", username, peer = %self.peer_addr, "authentication failed");
                (response.code, response.text)
            }
        }
    }

    /// The envelope collected so far, handed over when DATA starts.
    pub fn take_envelope(&mut self) -> Option<Envelope> {
        self.envelope.take()
    }
}

/// Lenient RFC 5321 check with a unicode escape hatch: non-ASCII characters
/// are substituted before validation so SMTPUTF8 addresses pass the
/// ASCII-only grammar.
fn is_valid_recipient(address: &str) -> bool {
    let ascii_proxy: String = address
        .chars()
        .map(|c| if c.is_ascii() { c } else { 'x' })
        .collect();
    EmailAddress::is_valid(&ascii_proxy)
}

fn decode_base64_line(data: &[u8]) -> Option<String> {
    let trimmed = data.trim_ascii_end();
    let decoded = Base64::decode_vec(std::str::from_utf8(trimmed).ok()?).ok()?;
    String::from_utf8(decoded).ok()
}

/// RFC 4616: authzid NUL authcid NUL password.
fn decode_plain_auth(data: &mut [u8]) -> Option<(String, String)> {
    let ascii_len = data.trim_ascii_end().len();
    let data = &mut data[..ascii_len];

    let decoded = Base64::decode_in_place(data).ok()?;
    let mut parts = decoded.split(|&b| b == 0);

    let authzid = parts.next()?;
    if !authzid.is_empty() {
        trace!(
            "ignoring authorization identity: {}",
            String::from_utf8_lossy(authzid)
        );
    }
    let username = std::str::from_utf8(parts.next()?).ok()?;
    let password = std::str::from_utf8(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some((username.to_string(), password.to_string()))
}
