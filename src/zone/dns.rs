#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use thiserror::Error;
use tracing::debug;

const SMTP_PORT: u16 = 25;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ResolveError(#[from] hickory_resolver::ResolveError);

/// One remote SMTP endpoint a delivery attempt can talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub host: String,
    pub port: u16,
}

/// Resolves the mail exchanges of a recipient domain. Tests swap the
/// backing lookup for a fixed record list.
#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    records: std::sync::Arc<Vec<(u16, String, u16)>>,
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new() -> Self {
        let mut options = ResolverOpts::default();
        options.attempts = 4;
        options.negative_max_ttl = Some(std::time::Duration::from_secs(20));

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .with_options(options)
            .build(),
        }
    }

    /// A resolver answering every MX query with one fixed exchange.
    #[cfg(test)]
    pub fn mock(host: &str, port: u16) -> Self {
        Self {
            records: std::sync::Arc::new(vec![(5, host.to_string(), port)]),
        }
    }

    /// A resolver for domains that publish no MX records at all.
    #[cfg(test)]
    pub fn mock_without_mx() -> Self {
        Self {
            records: std::sync::Arc::new(Vec::new()),
        }
    }

    /// Start walking a domain's exchanges in preference order. Each level
    /// is offered once per walk, so a failing exchange is not retried
    /// within one delivery attempt.
    pub fn walk(&self, domain: &str) -> MxWalk<'_> {
        let mut fqdn = domain.to_string();
        if !fqdn.ends_with('.') {
            fqdn.push('.');
        }

        MxWalk {
            resolver: self,
            domain: fqdn,
            floor: Some(0),
        }
    }

    /// `(preference, host, port)` per published MX record.
    async fn lookup_exchanges(
        &self,
        domain: &str,
    ) -> Result<Vec<(u16, String, u16)>, ResolveError> {
        #[cfg(not(test))]
        {
            Ok(self
                .resolver
                .mx_lookup(domain)
                .await?
                .iter()
                .map(|mx| (mx.preference(), mx.exchange().to_utf8(), SMTP_PORT))
                .collect())
        }
        #[cfg(test)]
        {
            let _ = domain;
            Ok(self.records.as_ref().clone())
        }
    }
}

#[cfg(not(test))]
impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Preference-ordered iteration over a domain's mail exchanges. `floor` is
/// the lowest preference level not yet offered; a domain without any MX
/// record yields itself once, on the implicit-MX rule.
pub struct MxWalk<'a> {
    resolver: &'a DnsResolver,
    domain: String,
    floor: Option<u32>,
}

impl MxWalk<'_> {
    pub async fn next(&mut self) -> Result<Option<Exchange>, ResolveError> {
        let Some(floor) = self.floor else {
            return Ok(None);
        };

        let records = self.resolver.lookup_exchanges(&self.domain).await?;

        if records.is_empty() {
            self.floor = None;
            if floor == 0 {
                return Ok(Some(Exchange {
                    host: self.domain.clone(),
                    port: SMTP_PORT,
                }));
            }
            return Ok(None);
        }

        let best = records
            .into_iter()
            .filter(|(preference, _, _)| u32::from(*preference) >= floor)
            .min_by_key(|(preference, _, _)| *preference);

        Ok(match best {
            Some((preference, host, port)) => {
                self.floor = Some(u32::from(preference) + 1);
                debug!(domain = self.domain, host, preference, "next mail exchange");
                Some(Exchange { host, port })
            }
            None => {
                self.floor = None;
                None
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn offers_each_preference_level_once() {
        let dns = DnsResolver::mock("mx.example.com", 2525);
        let mut walk = dns.walk("example.com");

        let exchange = walk.next().await.unwrap().unwrap();
        assert_eq!(exchange.host, "mx.example.com");
        assert_eq!(exchange.port, 2525);

        // the single exchange was offered, the walk is exhausted
        assert!(walk.next().await.unwrap().is_none());
        assert!(walk.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_mx_falls_back_to_the_domain_itself() {
        let dns = DnsResolver::mock_without_mx();
        let mut walk = dns.walk("example.com");

        let exchange = walk.next().await.unwrap().unwrap();
        assert_eq!(exchange.host, "example.com.");
        assert_eq!(exchange.port, 25);

        // the implicit exchange is offered only once
        assert!(walk.next().await.unwrap().is_none());
    }
}
