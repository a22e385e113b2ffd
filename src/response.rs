use thiserror::Error;

/// An SMTP reply that must reach the client verbatim. Hooks and pipeline
/// stages fail with this type when the failure has a protocol-level answer;
/// everything else surfaces as a generic 451.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code} {text}")]
pub struct SmtpResponse {
    pub code: u16,
    pub text: String,
}

impl SmtpResponse {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn too_many_recipients() -> Self {
        Self::new(452, "4.5.3 Too many recipients")
    }

    pub fn bad_recipient(address: &str) -> Self {
        Self::new(553, format!("5.1.3 Invalid recipient <{address}>"))
    }

    pub fn message_too_large(max_size: u64) -> Self {
        Self::new(
            552,
            format!("5.3.4 Message exceeds the maximum size of {max_size} bytes"),
        )
    }

    pub fn service_unavailable() -> Self {
        Self::new(451, "4.3.0 Requested action aborted, try again later")
    }

    pub fn shutting_down() -> Self {
        Self::new(421, "4.3.2 Service shutting down, closing transmission channel")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }
}
