//! Transport resolution.
//!
//! Maps a recipient address to the endpoint its message is submitted to:
//! the configured relay, or the preferred mail exchanger of the recipient's
//! domain.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{DeliveryMode, TlsMode};
use crate::errors::{MailerError, MailerErrorKind, MailerResult};

/// One MX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Exchange host name as returned by DNS.
    pub exchange: String,
    /// Preference (lower is preferred).
    pub preference: u16,
}

impl MxRecord {
    /// Creates a record.
    pub fn new(exchange: impl Into<String>, preference: u16) -> Self {
        Self {
            exchange: exchange.into(),
            preference,
        }
    }

    /// Returns true for a null MX (RFC 7505), which means "accepts no mail".
    pub fn is_null(&self) -> bool {
        matches!(self.exchange.as_str(), "" | ".")
    }
}

/// Source of MX records.
///
/// An empty list means the domain has no MX records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// Looks up the MX records of `domain`.
    async fn lookup_mx(&self, domain: &str) -> MailerResult<Vec<MxRecord>>;
}

/// [`MxLookup`] backed by `trust-dns-resolver`.
pub struct DnsMxLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsMxLookup {
    /// Creates a lookup using the resolver's default upstream servers.
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            timeout,
        }
    }

    /// Creates a lookup from the host's resolver configuration.
    pub fn from_system_conf(timeout: Duration) -> MailerResult<Self> {
        let (config, mut opts) = trust_dns_resolver::system_conf::read_system_conf().map_err(|e| {
            MailerError::configuration(format!("Cannot read system DNS configuration: {}", e))
                .with_cause(e)
        })?;
        opts.timeout = timeout;
        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        })
    }
}

/// Returns `domain` as a fully qualified name so search domains never apply.
fn absolute_name(domain: &str) -> String {
    if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{}.", domain)
    }
}

impl fmt::Debug for DnsMxLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsMxLookup")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl MxLookup for DnsMxLookup {
    async fn lookup_mx(&self, domain: &str) -> MailerResult<Vec<MxRecord>> {
        let fqdn = absolute_name(domain);
        let lookup = tokio::time::timeout(self.timeout, self.resolver.mx_lookup(fqdn.as_str()))
            .await
            .map_err(|_| {
                MailerError::resolution(
                    MailerErrorKind::DnsLookupFailed,
                    format!("MX lookup for {} timed out", domain),
                )
            })?;

        match lookup {
            Ok(records) => Ok(records
                .iter()
                .map(|mx| MxRecord::new(mx.exchange().to_utf8(), mx.preference()))
                .collect()),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(err) => Err(MailerError::resolution(
                MailerErrorKind::DnsLookupFailed,
                format!("MX lookup for {} failed: {}", domain, err),
            )
            .with_cause(err)),
        }
    }
}

/// Where a message is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportEndpoint {
    /// The configured relay.
    FixedRelay {
        /// Relay host.
        host: String,
        /// Relay port.
        port: u16,
        /// TLS mode.
        tls_mode: TlsMode,
    },
    /// A recipient domain's mail exchanger.
    DomainMx {
        /// Exchange host, without the trailing root dot.
        resolved_host: String,
        /// Port.
        port: u16,
        /// TLS mode.
        tls_mode: TlsMode,
    },
}

impl TransportEndpoint {
    /// Returns the host to connect to.
    pub fn host(&self) -> &str {
        match self {
            TransportEndpoint::FixedRelay { host, .. } => host,
            TransportEndpoint::DomainMx { resolved_host, .. } => resolved_host,
        }
    }

    /// Returns the port to connect to.
    pub fn port(&self) -> u16 {
        match self {
            TransportEndpoint::FixedRelay { port, .. } | TransportEndpoint::DomainMx { port, .. } => {
                *port
            }
        }
    }

    /// Returns the TLS mode.
    pub fn tls_mode(&self) -> TlsMode {
        match self {
            TransportEndpoint::FixedRelay { tls_mode, .. }
            | TransportEndpoint::DomainMx { tls_mode, .. } => *tls_mode,
        }
    }

    /// Returns true if the session upgrades with STARTTLS.
    pub fn use_starttls(&self) -> bool {
        matches!(self.tls_mode(), TlsMode::StartTls | TlsMode::StartTlsRequired)
    }

    /// Returns true for the fixed relay.
    pub fn is_relay(&self) -> bool {
        matches!(self, TransportEndpoint::FixedRelay { .. })
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }
}

impl fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

/// Returns the domain part of an address.
pub fn domain_of(email: &str) -> MailerResult<&str> {
    match email.rsplit_once('@') {
        Some((_, domain)) if !domain.trim().is_empty() => Ok(domain.trim()),
        _ => Err(MailerError::resolution(
            MailerErrorKind::MissingDomain,
            format!("address {:?} has no domain", email),
        )),
    }
}

/// Chooses the exchange with the lowest preference.
///
/// Ties go to the record listed first.
pub fn preferred_exchange(records: &[MxRecord]) -> Option<String> {
    records
        .iter()
        .filter(|r| !r.is_null())
        .fold(None::<&MxRecord>, |best, r| match best {
            Some(b) if b.preference <= r.preference => Some(b),
            _ => Some(r),
        })
        .map(|r| r.exchange.trim_end_matches('.').to_string())
}

#[derive(Debug, Clone)]
struct CachedFailure {
    kind: MailerErrorKind,
    message: String,
}

/// Per-campaign resolver with a domain cache.
pub struct TransportResolver {
    mode: DeliveryMode,
    lookup: Arc<dyn MxLookup>,
    cache: HashMap<String, Result<TransportEndpoint, CachedFailure>>,
    lookups: usize,
}

impl TransportResolver {
    /// Creates a resolver for one campaign run.
    pub fn new(mode: DeliveryMode, lookup: Arc<dyn MxLookup>) -> Self {
        Self {
            mode,
            lookup,
            cache: HashMap::new(),
            lookups: 0,
        }
    }

    /// Returns the endpoint for `email`.
    ///
    /// In relay mode this never touches DNS. In MX mode each domain is
    /// looked up at most once; failures are remembered too.
    pub async fn resolve(&mut self, email: &str) -> MailerResult<TransportEndpoint> {
        let mx = match &self.mode {
            DeliveryMode::Relay(relay) => {
                return Ok(TransportEndpoint::FixedRelay {
                    host: relay.host.clone(),
                    port: relay.port,
                    tls_mode: relay.tls_mode,
                })
            }
            DeliveryMode::DirectMx(mx) => mx.clone(),
        };

        let domain = domain_of(email)?.to_ascii_lowercase();
        if let Some(cached) = self.cache.get(&domain) {
            return cached
                .clone()
                .map_err(|f| MailerError::resolution(f.kind, f.message));
        }

        self.lookups += 1;
        let result = match self.lookup.lookup_mx(&domain).await {
            Ok(records) => match preferred_exchange(&records) {
                Some(host) => Ok(TransportEndpoint::DomainMx {
                    resolved_host: host,
                    port: mx.port,
                    tls_mode: if mx.starttls {
                        TlsMode::StartTls
                    } else {
                        TlsMode::None
                    },
                }),
                None => Err(MailerError::resolution(
                    MailerErrorKind::NoMxRecords,
                    format!("domain {} has no usable MX records", domain),
                )),
            },
            Err(err) => Err(err),
        };

        #[cfg(feature = "tracing")]
        match &result {
            Ok(endpoint) => tracing::debug!(domain = %domain, endpoint = %endpoint, "Resolved MX"),
            Err(err) => tracing::debug!(domain = %domain, error = %err, "MX resolution failed"),
        }

        let cached = match &result {
            Ok(endpoint) => Ok(endpoint.clone()),
            Err(err) => Err(CachedFailure {
                kind: err.kind(),
                message: err.message().to_string(),
            }),
        };
        self.cache.insert(domain, cached);
        result
    }

    /// Returns how many DNS lookups this resolver has made.
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}

impl fmt::Debug for TransportResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResolver")
            .field("mode", &self.mode)
            .field("cached_domains", &self.cache.len())
            .field("lookups", &self.lookups)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MxConfig, RelayConfig};
    use crate::errors::ErrorCategory;

    fn mx_mode() -> DeliveryMode {
        DeliveryMode::DirectMx(MxConfig::default())
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("alice@example.com").unwrap(), "example.com");
        for bad in ["alice", "alice@", "alice@  "] {
            let err = domain_of(bad).unwrap_err();
            assert_eq!(err.kind(), MailerErrorKind::MissingDomain);
            assert_eq!(err.category(), ErrorCategory::Resolution);
        }
    }

    #[test]
    fn test_absolute_name() {
        assert_eq!(absolute_name("example.com"), "example.com.");
        assert_eq!(absolute_name("example.com."), "example.com.");
    }

    #[test]
    fn test_preferred_exchange() {
        let records = vec![
            MxRecord::new("mx2.example.com.", 20),
            MxRecord::new("mx1.example.com.", 10),
            MxRecord::new("mx1b.example.com.", 10),
        ];
        assert_eq!(preferred_exchange(&records).as_deref(), Some("mx1.example.com"));
        assert_eq!(preferred_exchange(&[]), None);
        assert_eq!(preferred_exchange(&[MxRecord::new(".", 0)]), None);
    }

    #[tokio::test]
    async fn test_relay_mode_skips_dns() {
        let mut lookup = MockMxLookup::new();
        lookup.expect_lookup_mx().never();

        let mode = DeliveryMode::Relay(RelayConfig::new("smtp.gmail.com"));
        let mut resolver = TransportResolver::new(mode, Arc::new(lookup));
        let endpoint = resolver.resolve("anyone@anywhere.org").await.unwrap();

        assert_eq!(
            endpoint,
            TransportEndpoint::FixedRelay {
                host: "smtp.gmail.com".into(),
                port: 587,
                tls_mode: TlsMode::StartTlsRequired,
            }
        );
        assert!(endpoint.use_starttls());
        assert_eq!(resolver.lookups(), 0);
    }

    #[tokio::test]
    async fn test_mx_resolution_is_cached() {
        let mut lookup = MockMxLookup::new();
        lookup
            .expect_lookup_mx()
            .withf(|domain| domain.eq_ignore_ascii_case("example.com"))
            .times(1)
            .returning(|_| Ok(vec![MxRecord::new("mx.example.com.", 5)]));

        let mut resolver = TransportResolver::new(mx_mode(), Arc::new(lookup));
        let first = resolver.resolve("a@example.com").await.unwrap();
        let second = resolver.resolve("b@EXAMPLE.com").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.host(), "mx.example.com");
        assert_eq!(first.port(), 25);
        assert_eq!(first.tls_mode(), TlsMode::StartTls);
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn test_negative_results_are_cached() {
        let mut lookup = MockMxLookup::new();
        lookup
            .expect_lookup_mx()
            .withf(|domain| domain.eq_ignore_ascii_case("nomail.example"))
            .times(1)
            .returning(|_| Ok(vec![]));
        lookup
            .expect_lookup_mx()
            .withf(|domain| domain.eq_ignore_ascii_case("broken.example"))
            .times(1)
            .returning(|_| {
                Err(MailerError::resolution(
                    MailerErrorKind::DnsLookupFailed,
                    "SERVFAIL",
                ))
            });

        let mut resolver = TransportResolver::new(mx_mode(), Arc::new(lookup));
        for _ in 0..2 {
            let err = resolver.resolve("x@nomail.example").await.unwrap_err();
            assert_eq!(err.kind(), MailerErrorKind::NoMxRecords);
            let err = resolver.resolve("x@broken.example").await.unwrap_err();
            assert_eq!(err.kind(), MailerErrorKind::DnsLookupFailed);
            assert!(err.is_temporary());
        }
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test]
    async fn test_missing_domain_does_not_query() {
        let mut lookup = MockMxLookup::new();
        lookup.expect_lookup_mx().never();

        let mut resolver = TransportResolver::new(mx_mode(), Arc::new(lookup));
        let err = resolver.resolve("nobody").await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MissingDomain);
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn test_dns_lookup_real_domain() {
        let lookup = DnsMxLookup::new(Duration::from_secs(5));
        let records = lookup.lookup_mx("gmail.com").await.unwrap();
        assert!(!records.is_empty());
    }
}
