//! Peer and region discovery over the private network.
//!
//! Deployed instances answer through the private network nameserver:
//!
//! - `regions.<app>.internal` TXT: comma separated region codes
//! - `vms.<app>.internal` TXT: comma separated `<alloc id> <region>` entries
//! - `<app>.internal` AAAA: one address per running instance
//!
//! Outside a deployment [`LocalDiscovery`] stands in with a single instance.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::error::DiscoveryError;

/// Nameserver used when `FLY_NAMESERVER` is unset.
pub const DEFAULT_NAMESERVER: IpAddr = IpAddr::V6(Ipv6Addr::new(0xfdaa, 0, 0, 0, 0, 0, 0, 3));

/// Hostname of this instance's private network address.
pub const PRIVATE_HOST: &str = "fly-local-6pn";

const DNS_PORT: u16 = 53;
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);
const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Answers questions about the instances of an app.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Regions `app` is deployed in.
    async fn regions(&self, app: &str) -> Result<Vec<String>, DiscoveryError>;

    /// Private addresses of every instance of `app`, including this one.
    async fn peer_ips(&self, app: &str) -> Result<Vec<IpAddr>, DiscoveryError>;

    /// Allocation ids of every instance of `app`.
    async fn peer_alloc_ids(&self, app: &str) -> Result<Vec<String>, DiscoveryError>;

    /// This instance's private address.
    async fn private_ip(&self) -> IpAddr;
}

/// Picks DNS discovery when running as a deployed app, local otherwise.
pub fn from_env(app_name: Option<&str>) -> Arc<dyn Discovery> {
    match app_name {
        Some(_) => Arc::new(DnsDiscovery::from_env()),
        None => Arc::new(LocalDiscovery),
    }
}

/// Discovery backed by the private network nameserver.
pub struct DnsDiscovery {
    resolver: TokioAsyncResolver,
}

impl DnsDiscovery {
    pub fn new(nameserver: IpAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[nameserver], DNS_PORT, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = QUERY_TIMEOUT;
        opts.attempts = 2;
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Uses `FLY_NAMESERVER`, falling back to [`DEFAULT_NAMESERVER`].
    pub fn from_env() -> Self {
        let nameserver = match std::env::var("FLY_NAMESERVER") {
            Ok(raw) if !raw.is_empty() => raw.parse().unwrap_or_else(|err| {
                warn!(nameserver = %raw, error = %err, "invalid FLY_NAMESERVER, using default");
                DEFAULT_NAMESERVER
            }),
            _ => DEFAULT_NAMESERVER,
        };
        debug!(%nameserver, "using private network nameserver");
        Self::new(nameserver)
    }

    async fn txt(&self, query: String) -> Result<Vec<String>, DiscoveryError> {
        let lookup = bounded(&query, self.resolver.txt_lookup(fqdn(&query))).await?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect())
    }
}

async fn bounded<T, F>(query: &str, fut: F) -> Result<T, DiscoveryError>
where
    F: std::future::Future<Output = Result<T, hickory_resolver::error::ResolveError>>,
{
    // Covers every attempt the resolver makes.
    let limit = QUERY_TIMEOUT * 3;
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(DiscoveryError::Resolve {
            query: query.to_string(),
            source,
        }),
        Err(_) => Err(DiscoveryError::Timeout {
            query: query.to_string(),
            timeout: limit,
        }),
    }
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn regions(&self, app: &str) -> Result<Vec<String>, DiscoveryError> {
        let records = self.txt(format!("regions.{}.internal", app)).await?;
        Ok(split_regions(records))
    }

    async fn peer_ips(&self, app: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
        let query = format!("{}.internal", app);
        let lookup = bounded(&query, self.resolver.ipv6_lookup(fqdn(&query))).await?;
        let ips = lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect();
        // This instance may not be registered yet.
        Ok(with_ip(ips, self.private_ip().await))
    }

    async fn peer_alloc_ids(&self, app: &str) -> Result<Vec<String>, DiscoveryError> {
        let records = self.txt(format!("vms.{}.internal", app)).await?;
        Ok(alloc_ids(records))
    }

    async fn private_ip(&self) -> IpAddr {
        match tokio::net::lookup_host((PRIVATE_HOST, 0)).await {
            Ok(mut addrs) => addrs.next().map_or(LOOPBACK, |addr| addr.ip()),
            Err(err) => {
                debug!(error = %err, "no private address, using loopback");
                LOOPBACK
            }
        }
    }
}

/// A single, undeployed instance.
pub struct LocalDiscovery;

/// Allocation id reported for a local instance.
pub const LOCAL_ALLOC_ID: &str = "local-id";

#[async_trait]
impl Discovery for LocalDiscovery {
    async fn regions(&self, _app: &str) -> Result<Vec<String>, DiscoveryError> {
        Ok(vec!["local".to_string()])
    }

    async fn peer_ips(&self, _app: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
        Ok(vec![LOOPBACK])
    }

    async fn peer_alloc_ids(&self, _app: &str) -> Result<Vec<String>, DiscoveryError> {
        Ok(vec![LOCAL_ALLOC_ID.to_string()])
    }

    async fn private_ip(&self) -> IpAddr {
        LOOPBACK
    }
}

fn split_regions(records: impl IntoIterator<Item = String>) -> Vec<String> {
    records
        .into_iter()
        .flat_map(|record| {
            record
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn alloc_ids(records: impl IntoIterator<Item = String>) -> Vec<String> {
    records
        .into_iter()
        .flat_map(|record| {
            record
                .split(',')
                .filter_map(|entry| {
                    let (id, _region) = entry.trim().split_once(' ')?;
                    Some(id.to_string())
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

fn with_ip(mut ips: Vec<IpAddr>, ip: IpAddr) -> Vec<IpAddr> {
    if !ips.contains(&ip) {
        ips.push(ip);
    }
    ips
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Canned answers keyed by app name.
    #[derive(Default)]
    pub(crate) struct FakeDiscovery {
        pub regions: HashMap<String, Vec<String>>,
        pub ips: HashMap<String, Vec<IpAddr>>,
        pub allocs: HashMap<String, Vec<String>>,
        pub own_ip: Option<IpAddr>,
    }

    fn missing(app: &str) -> DiscoveryError {
        DiscoveryError::Timeout {
            query: format!("{}.internal", app),
            timeout: QUERY_TIMEOUT,
        }
    }

    #[async_trait]
    impl Discovery for FakeDiscovery {
        async fn regions(&self, app: &str) -> Result<Vec<String>, DiscoveryError> {
            self.regions.get(app).cloned().ok_or_else(|| missing(app))
        }

        async fn peer_ips(&self, app: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
            self.ips.get(app).cloned().ok_or_else(|| missing(app))
        }

        async fn peer_alloc_ids(&self, app: &str) -> Result<Vec<String>, DiscoveryError> {
            self.allocs.get(app).cloned().ok_or_else(|| missing(app))
        }

        async fn private_ip(&self) -> IpAddr {
            self.own_ip.unwrap_or(LOOPBACK)
        }
    }

    #[test]
    fn regions_split_on_commas_across_records() {
        let regions = split_regions(vec!["iad,lhr".to_string(), " syd ,".to_string()]);
        assert_eq!(regions, vec!["iad", "lhr", "syd"]);
    }

    #[test]
    fn alloc_ids_take_the_first_field() {
        let ids = alloc_ids(vec![
            "3d8d1a2b iad,9f1e2d3c lhr".to_string(),
            "malformed".to_string(),
        ]);
        assert_eq!(ids, vec!["3d8d1a2b", "9f1e2d3c"]);
    }

    #[test]
    fn own_ip_is_added_once() {
        let a: IpAddr = "fdaa::1".parse().unwrap();
        let b: IpAddr = "fdaa::2".parse().unwrap();
        assert_eq!(with_ip(vec![a], b), vec![a, b]);
        assert_eq!(with_ip(vec![a, b], b), vec![a, b]);
    }

    #[test]
    fn queries_are_fully_qualified() {
        assert_eq!(fqdn("vms.app.internal"), "vms.app.internal.");
        assert_eq!(fqdn("vms.app.internal."), "vms.app.internal.");
    }

    #[tokio::test]
    async fn local_discovery_is_a_single_instance() {
        let local = LocalDiscovery;
        assert_eq!(local.regions("any").await.unwrap(), vec!["local"]);
        assert_eq!(local.peer_ips("any").await.unwrap(), vec![LOOPBACK]);
        assert_eq!(local.peer_alloc_ids("any").await.unwrap(), vec![LOCAL_ALLOC_ID]);
    }
}
