use crate::{address, envelope::Envelope, headers::Headers};
use serde::Deserialize;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, RwLock},
};
use tracing::debug;

/// The immutable routing state. A config reload builds a fresh value and
/// swaps it in atomically; lookups never see a half-updated table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutingTables {
    /// header name (folded) -> header value (folded) -> zone
    pub routing_headers: HashMap<String, HashMap<String, String>>,
    pub sender_domains: HashMap<String, String>,
    pub recipient_domains: HashMap<String, String>,
    pub origins: HashMap<IpAddr, String>,
    pub default_zone: Option<String>,
}

impl RoutingTables {
    /// Collect the matching keys declared on the zone configurations into
    /// one routing state.
    pub fn from_zones(zones: &[crate::zone::ZoneConfig]) -> Self {
        let mut tables = Self::default();
        for zone in zones {
            for domain in &zone.sender_domains {
                tables.sender_domains.insert(domain.clone(), zone.name.clone());
            }
            for domain in &zone.recipient_domains {
                tables
                    .recipient_domains
                    .insert(domain.clone(), zone.name.clone());
            }
            for (header, value) in &zone.routing_headers {
                tables
                    .routing_headers
                    .entry(header.clone())
                    .or_default()
                    .insert(value.clone(), zone.name.clone());
            }
            for origin in &zone.origin_addresses {
                tables.origins.insert(*origin, zone.name.clone());
            }
            if zone.default {
                tables.default_zone = Some(zone.name.clone());
            }
        }
        tables
    }

    /// Normalize all keys so lookups can fold once and compare directly.
    fn folded(mut self) -> Self {
        self.routing_headers = self
            .routing_headers
            .into_iter()
            .map(|(name, values)| {
                let values = values
                    .into_iter()
                    .map(|(value, zone)| (value.trim().to_lowercase(), zone))
                    .collect();
                (name.trim().to_lowercase(), values)
            })
            .collect();
        self.sender_domains = self
            .sender_domains
            .into_iter()
            .map(|(domain, zone)| (address::normalize_domain(&domain), zone))
            .collect();
        self.recipient_domains = self
            .recipient_domains
            .into_iter()
            .map(|(domain, zone)| (address::normalize_domain(&domain), zone))
            .collect();
        self
    }
}

/// Maps an envelope to a sending zone. Match priority: routing headers,
/// then sender domain, then recipient domain, then origin IP, then the
/// default zone.
pub struct Router {
    tables: RwLock<Arc<RoutingTables>>,
}

impl Router {
    pub fn new(tables: RoutingTables) -> Self {
        Self {
            tables: RwLock::new(Arc::new(tables.folded())),
        }
    }

    pub fn reload(&self, tables: RoutingTables) {
        *self.tables.write().unwrap() = Arc::new(tables.folded());
    }

    fn snapshot(&self) -> Arc<RoutingTables> {
        self.tables.read().unwrap().clone()
    }

    /// Resolve the zone for an envelope, considering one recipient when
    /// given (deliveries of one envelope may land in distinct zones).
    /// Returns `None` when nothing matches and no default is configured;
    /// the caller bounces such mail with a permanent error.
    pub fn zone_for(
        &self,
        envelope: &Envelope,
        headers: &Headers,
        recipient: Option<&str>,
    ) -> Option<String> {
        let tables = self.snapshot();

        // last header wins, so walk the block bottom up
        for line in headers.lines().iter().rev() {
            let Some(values) = tables.routing_headers.get(line.key()) else {
                continue;
            };
            let value = line.value().trim().to_lowercase();
            if let Some(zone) = values.get(&value) {
                debug!(header = line.key(), zone, "routed by header");
                return Some(zone.clone());
            }
            // address-bearing headers also match on the bare address
            if let Some(mailbox) = address::parse_address_list(&value).into_iter().next()
                && let Some(zone) = values.get(&mailbox.address)
            {
                debug!(header = line.key(), zone, "routed by header address");
                return Some(zone.clone());
            }
        }

        let sender_domain = envelope.sender_domain();
        if !sender_domain.is_empty()
            && let Some(zone) = tables.sender_domains.get(sender_domain)
        {
            return Some(zone.clone());
        }

        if let Some(recipient) = recipient {
            let domain = address::normalize_domain(address::domain_of(recipient));
            if let Some(zone) = tables.recipient_domains.get(&domain) {
                return Some(zone.clone());
            }
        }

        if let Some(zone) = tables.origins.get(&envelope.origin) {
            return Some(zone.clone());
        }

        tables.default_zone.clone()
    }
}
