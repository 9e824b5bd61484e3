//! Allow-list of CI provider egress addresses
//!
//! AppVeyor publishes a fixed set of worker addresses. Travis CI publishes
//! its NAT pool as a DNS record that changes over time, so that part is
//! fetched on demand and can be overridden.

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

pub const TRAVIS_NAT_URL: &str = "https://dnsjson.com/nat.travisci.net/A.json";

// https://www.appveyor.com/docs/build-environment/#ip-addresses
const APPVEYOR_NETWORKS: &[&str] = &[
    "74.205.54.20/32",
    "104.197.110.30/32",
    "104.197.145.181/32",
    "146.148.85.29/32",
    "67.225.139.254/32",
    "67.225.138.82/32",
    "67.225.139.144/32",
    "138.91.141.243/32",
];

#[derive(Deserialize)]
struct TravisNatResponse {
    results: TravisNatResults,
}

#[derive(Deserialize)]
struct TravisNatResults {
    #[serde(default)]
    records: Vec<String>,
}

/// Parse `ip` or `ip:port` (`[v6]:port` for IPv6).
pub fn parse_remote_addr(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    addr.parse::<SocketAddr>()
        .map(|socket| socket.ip())
        .or_else(|_| addr.parse::<IpAddr>())
        .ok()
}

#[derive(Debug)]
pub struct CiAllowList {
    appveyor: Vec<IpNetwork>,
    travis: RwLock<HashSet<IpAddr>>,
}

impl Default for CiAllowList {
    fn default() -> Self {
        Self::new()
    }
}

impl CiAllowList {
    /// AppVeyor networks only; Travis addresses are empty until refreshed.
    pub fn new() -> Self {
        let appveyor = APPVEYOR_NETWORKS
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNetwork>() {
                Ok(network) => Some(network),
                Err(err) => {
                    warn!(cidr = %cidr, error = %err, "invalid built-in CIDR");
                    None
                }
            })
            .collect();
        Self {
            appveyor,
            travis: RwLock::new(HashSet::new()),
        }
    }

    fn travis_read(&self) -> RwLockReadGuard<'_, HashSet<IpAddr>> {
        self.travis.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn travis_write(&self) -> RwLockWriteGuard<'_, HashSet<IpAddr>> {
        self.travis.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the Travis CI address set.
    pub fn set_travis_addrs<I>(&self, addrs: I)
    where
        I: IntoIterator<Item = IpAddr>,
    {
        *self.travis_write() = addrs.into_iter().collect();
    }

    pub fn travis_addrs(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self.travis_read().iter().copied().collect();
        addrs.sort();
        addrs
    }

    /// Fetch the published Travis CI NAT pool and replace the current set.
    pub async fn refresh_travis(&self, client: &reqwest::Client) -> Result<usize> {
        self.refresh_travis_from(client, TRAVIS_NAT_URL).await
    }

    pub async fn refresh_travis_from(&self, client: &reqwest::Client, url: &str) -> Result<usize> {
        let resp = client
            .get(url)
            .send()
            .await
            .context("Failed to fetch Travis CI addresses")?
            .error_for_status()
            .context("Travis CI address lookup failed")?;
        let body: TravisNatResponse = resp
            .json()
            .await
            .context("Failed to parse Travis CI addresses")?;

        let addrs: HashSet<IpAddr> = body
            .results
            .records
            .iter()
            .filter_map(|record| {
                let parsed = record.trim().parse::<IpAddr>().ok();
                if parsed.is_none() {
                    debug!(record = %record, "skipping non-address record");
                }
                parsed
            })
            .collect();
        let count = addrs.len();
        *self.travis_write() = addrs;
        Ok(count)
    }

    pub fn is_from_appveyor(&self, addr: &str) -> bool {
        parse_remote_addr(addr)
            .is_some_and(|ip| self.appveyor.iter().any(|network| network.contains(ip)))
    }

    pub fn is_from_travis(&self, addr: &str) -> bool {
        parse_remote_addr(addr).is_some_and(|ip| self.travis_read().contains(&ip))
    }

    pub fn is_from_ci(&self, addr: &str) -> bool {
        self.is_from_appveyor(addr) || self.is_from_travis(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ALLOWED: &str = "67.225.139.254:8000";
    const NOT_ALLOWED: &str = "93.184.216.34:8000";

    #[test]
    fn test_parse_remote_addr_forms() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(parse_remote_addr("10.0.0.1"), Some(v4));
        assert_eq!(parse_remote_addr("10.0.0.1:443"), Some(v4));
        assert_eq!(
            parse_remote_addr("[2001:db8::1]:8000"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(parse_remote_addr("2001:db8::1"), Some("2001:db8::1".parse().unwrap()));
        assert!(parse_remote_addr("example.com:80").is_none());
        assert!(parse_remote_addr("").is_none());
    }

    #[test]
    fn test_is_from_appveyor() {
        let list = CiAllowList::new();
        assert!(list.is_from_appveyor(ALLOWED));
        assert!(list.is_from_appveyor("67.225.139.254"));
        assert!(!list.is_from_appveyor(NOT_ALLOWED));
    }

    #[test]
    fn test_is_from_ci() {
        let list = CiAllowList::new();
        assert!(list.is_from_ci(ALLOWED));
        assert!(!list.is_from_ci(NOT_ALLOWED));
        assert!(!list.is_from_ci("garbage"));
    }

    #[test]
    fn test_travis_override() {
        let list = CiAllowList::new();
        assert!(!list.is_from_travis("198.51.100.7:8000"));

        list.set_travis_addrs(["198.51.100.7".parse::<IpAddr>().unwrap()]);
        assert!(list.is_from_travis("198.51.100.7:8000"));
        assert!(list.is_from_ci("198.51.100.7"));
        assert!(!list.is_from_travis(NOT_ALLOWED));

        list.set_travis_addrs(Vec::<IpAddr>::new());
        assert!(!list.is_from_travis("198.51.100.7:8000"));
    }

    #[tokio::test]
    async fn test_refresh_travis_replaces_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nat.travisci.net/A.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": {"records": ["198.51.100.7", "198.51.100.8", "not-an-ip"]}
            })))
            .mount(&server)
            .await;

        let list = CiAllowList::new();
        list.set_travis_addrs(["203.0.113.1".parse::<IpAddr>().unwrap()]);
        let url = format!("{}/nat.travisci.net/A.json", server.uri());
        let count = list
            .refresh_travis_from(&reqwest::Client::new(), &url)
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert!(list.is_from_travis("198.51.100.8:8000"));
        assert!(!list.is_from_travis("203.0.113.1"));
        for addr in list.travis_addrs() {
            assert!(list.is_from_travis(&format!("{addr}:8000")));
        }
    }

    #[tokio::test]
    async fn test_refresh_travis_failure_keeps_old_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let list = CiAllowList::new();
        list.set_travis_addrs(["203.0.113.1".parse::<IpAddr>().unwrap()]);
        let url = format!("{}/nat.travisci.net/A.json", server.uri());
        assert!(list
            .refresh_travis_from(&reqwest::Client::new(), &url)
            .await
            .is_err());
        assert!(list.is_from_travis("203.0.113.1"));
    }
}
