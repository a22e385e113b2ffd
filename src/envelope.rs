use crate::{address, pipeline::dkim::HashAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Opaque, globally unique message id issued by the queue's sequence index.
pub type EnvelopeId = String;

/// TLS parameters of the ingress session, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsInfo {
    pub version: String,
    pub name: String,
}

/// DKIM configuration and the body hash computed on the ingress path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DkimInfo {
    pub hash_algo: HashAlgorithm,
    #[serde(default)]
    pub debug: bool,
    pub body_hash: Option<String>,
}

/// The SMTP-level message container. Immutable once the message has been
/// stored; everything the sending side needs travels in here alongside the
/// queued body blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    /// Name of the ingress interface that accepted the message.
    pub interface: String,
    /// Normalized return path, empty for bounces.
    pub from: String,
    /// Normalized recipients, in RCPT order, without duplicates.
    pub to: Vec<String>,
    pub origin: IpAddr,
    /// Reverse DNS of the origin, when known.
    pub originhost: Option<String>,
    /// HELO/EHLO hostname presented by the client.
    pub transhost: String,
    /// SMTP, ESMTP, ESMTPS, ESMTPSA, ...
    pub transtype: String,
    /// Authenticated username, empty when unauthenticated.
    pub user: String,
    pub tls: Option<TlsInfo>,
    pub time: DateTime<Utc>,
    pub sending_zone: String,
    /// Header block snapshot as encoded lines, taken at `message:store`.
    pub headers: Vec<String>,
    pub dkim: DkimInfo,
    pub body_size: u64,
}

impl Envelope {
    pub fn new(id: EnvelopeId, interface: impl Into<String>, origin: IpAddr) -> Self {
        Self {
            id,
            interface: interface.into(),
            from: String::new(),
            to: Vec::new(),
            origin,
            originhost: None,
            transhost: String::new(),
            transtype: "ESMTP".to_string(),
            user: String::new(),
            tls: None,
            time: Utc::now(),
            sending_zone: String::new(),
            headers: Vec::new(),
            dkim: DkimInfo::default(),
            body_size: 0,
        }
    }

    /// Add a normalized recipient, dropping duplicates. Returns whether the
    /// recipient was new.
    pub fn add_recipient(&mut self, recipient: String) -> bool {
        if self.to.contains(&recipient) {
            return false;
        }
        self.to.push(recipient);
        true
    }

    pub fn sender_domain(&self) -> &str {
        address::domain_of(&self.from)
    }

    pub fn is_authenticated(&self) -> bool {
        !self.user.is_empty()
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(String::new(), "default", IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// One recipient's outbound attempt, derived from an envelope at push time.
/// `(id, seq)` is unique, and in flight for at most one lock owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: EnvelopeId,
    /// Monotonic per envelope, 1-based.
    pub seq: u32,
    pub envelope: Envelope,
    pub recipient: String,
    /// ASCII-folded recipient domain.
    pub domain: String,
    pub sending_zone: String,
    pub attempts: u32,
    pub next_attempt: DateTime<Utc>,
    /// Optional override for the pool hash key.
    pub pool_hash: Option<String>,
    /// Sticky sender used for hashing when the zone pools by sender.
    pub sticky_from: Option<String>,
    /// Set when the blacklist filter had to be bypassed for this delivery.
    #[serde(default)]
    pub pool_disabled: bool,
}

impl Delivery {
    pub fn new(envelope: &Envelope, seq: u32, recipient: String, sending_zone: String) -> Self {
        let domain = address::normalize_domain(address::domain_of(&recipient));
        Self {
            id: envelope.id.clone(),
            seq,
            envelope: envelope.clone(),
            recipient,
            domain,
            sending_zone,
            attempts: 0,
            next_attempt: Utc::now(),
            pool_hash: None,
            sticky_from: None,
            pool_disabled: false,
        }
    }

    /// The key a sender-pooled zone hashes on: sticky sender, else the
    /// envelope sender, else `id.seq`.
    pub fn sender_hash_key(&self) -> String {
        if let Some(sticky) = &self.sticky_from {
            return sticky.clone();
        }
        if !self.envelope.from.is_empty() {
            return self.envelope.from.clone();
        }
        self.default_hash_key()
    }

    pub fn default_hash_key(&self) -> String {
        format!("{}.{}", self.id, self.seq)
    }
}

/// How the remote side judged a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCategory {
    Transient,
    Permanent,
    /// Transient, but the response indicates the source address is being
    /// refused and should be suppressed for this domain.
    Blacklist,
}

/// Structured remote response attached to defer and release operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub category: ResponseCategory,
    pub message: String,
    /// The local source address the attempt was made from.
    pub source_address: Option<IpAddr>,
}

impl RemoteResponse {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            category: ResponseCategory::Transient,
            message: message.into(),
            source_address: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            category: ResponseCategory::Permanent,
            message: message.into(),
            source_address: None,
        }
    }
}

/// Everything bounce generation downstream needs; rendering the actual
/// report is not this crate's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceIntent {
    pub id: EnvelopeId,
    pub seq: u32,
    pub recipient: String,
    pub response: String,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recipients_are_deduplicated() {
        let mut envelope = Envelope::default();
        assert!(envelope.add_recipient("a@example.com".into()));
        assert!(!envelope.add_recipient("a@example.com".into()));
        assert_eq!(envelope.to.len(), 1);
    }

    #[test]
    fn hash_keys_fall_back_in_order() {
        let mut envelope = Envelope::default();
        envelope.id = "abc123".into();
        envelope.from = "sender@example.com".into();

        let mut delivery = Delivery::new(&envelope, 1, "rcpt@example.org".into(), "default".into());
        assert_eq!(delivery.sender_hash_key(), "sender@example.com");
        assert_eq!(delivery.default_hash_key(), "abc123.1");

        delivery.sticky_from = Some("sticky@example.com".into());
        assert_eq!(delivery.sender_hash_key(), "sticky@example.com");

        delivery.sticky_from = None;
        delivery.envelope.from = String::new();
        assert_eq!(delivery.sender_hash_key(), "abc123.1");
    }

    #[test]
    fn delivery_domain_is_folded() {
        let envelope = Envelope::default();
        let delivery = Delivery::new(&envelope, 1, "user@EXAMPLE.org".into(), "default".into());
        assert_eq!(delivery.domain, "example.org");
    }
}
