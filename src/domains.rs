use serde_json::Value;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::RwLock,
};
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Per-domain property overrides with a defaults layer, mutable at runtime.
/// The interesting runtime state is `disabled_addresses`: source IPs that
/// remote feedback has suppressed for a domain, until their blacklist entry
/// expires.
#[derive(Debug, Default)]
pub struct DomainConfigStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    defaults: HashMap<String, Value>,
    domains: HashMap<String, HashMap<String, Value>>,
    disabled: HashMap<String, Vec<IpAddr>>,
}

impl DomainConfigStore {
    pub fn new(defaults: HashMap<String, Value>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                defaults,
                ..Default::default()
            }),
        }
    }

    /// Look a property up in the domain layer, falling back to defaults.
    pub fn get(&self, domain: &str, key: &str) -> Option<Value> {
        let inner = self.inner.read().unwrap();
        inner
            .domains
            .get(domain)
            .and_then(|props| props.get(key))
            .or_else(|| inner.defaults.get(key))
            .cloned()
    }

    pub fn set(&self, domain: &str, key: &str, value: Value) {
        let mut inner = self.inner.write().unwrap();
        inner
            .domains
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Concurrent outbound sessions allowed towards a domain.
    pub fn max_connections(&self, domain: &str) -> usize {
        self.get(domain, "maxConnections")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn disabled_addresses(&self, domain: &str) -> Vec<IpAddr> {
        self.inner
            .read()
            .unwrap()
            .disabled
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    /// Suppress a source address for a domain. Returns false when it was
    /// already suppressed.
    pub fn add_disabled_address(&self, domain: &str, address: IpAddr) -> bool {
        let mut inner = self.inner.write().unwrap();
        let list = inner.disabled.entry(domain.to_string()).or_default();
        if list.contains(&address) {
            return false;
        }
        list.push(address);
        info!(code = "ADDBLADDRESS", domain, address = %address, "source address disabled");
        true
    }

    pub fn remove_disabled_address(&self, domain: &str, address: IpAddr) {
        let mut inner = self.inner.write().unwrap();
        if let Some(list) = inner.disabled.get_mut(domain) {
            list.retain(|a| *a != address);
            if list.is_empty() {
                inner.disabled.remove(domain);
            }
            info!(code = "DELBLADDRESS", domain, address = %address, "source address restored");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn domain_layer_overrides_defaults() {
        let store = DomainConfigStore::new(HashMap::from([(
            "maxConnections".to_string(),
            Value::from(3),
        )]));

        assert_eq!(store.max_connections("example.com"), 3);

        store.set("example.com", "maxConnections", Value::from(10));
        assert_eq!(store.max_connections("example.com"), 10);
        assert_eq!(store.max_connections("other.example"), 3);
    }

    #[test]
    fn missing_key_uses_builtin_default() {
        let store = DomainConfigStore::default();
        assert_eq!(store.max_connections("example.com"), DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn disabled_addresses_round_trip() {
        let store = DomainConfigStore::default();
        let address: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(store.add_disabled_address("example.com", address));
        assert!(!store.add_disabled_address("example.com", address));
        assert_eq!(store.disabled_addresses("example.com"), vec![address]);
        assert!(store.disabled_addresses("other.example").is_empty());

        store.remove_disabled_address("example.com", address);
        assert!(store.disabled_addresses("example.com").is_empty());
    }
}
