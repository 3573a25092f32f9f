//! IP admission matcher (§4.1 "IP admission").
//!
//! The whitelist is read-through cached for 15 minutes via a single-entry
//! `moka` cache (grounded in the workspace's use of `moka` for read-through
//! caches elsewhere in the pack). On internal error the policy fails open
//! and logs, per spec.

use ipnet::IpNet;
use moka::future::Cache;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::collaborators::ProxyRepository;

const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// Single cache key: the whitelist is one gateway-wide singleton list.
const CACHE_KEY: u8 = 0;

#[derive(Debug, Clone)]
enum Rule {
    /// `0.0.0.0/0` — filtering disabled.
    Disabled,
    Net(IpNet),
}

/// IP admission matcher, backed by a 15-minute read-through cache over the
/// (collaborator) proxy repository.
pub struct IpWhitelist {
    repo: Arc<dyn ProxyRepository>,
    cache: Cache<u8, Arc<Vec<Rule>>>,
}

impl IpWhitelist {
    #[must_use]
    pub fn new(repo: Arc<dyn ProxyRepository>) -> Self {
        Self {
            repo,
            cache: Cache::builder().time_to_live(CACHE_TTL).build(),
        }
    }

    async fn rules(&self) -> Arc<Vec<Rule>> {
        self.cache
            .get_with(CACHE_KEY, async {
                match self.repo.ip_whitelist_entries().await {
                    Ok(entries) => Arc::new(parse_rules(&entries)),
                    Err(err) => {
                        error!(error = %err, "failed to load ip whitelist, failing open");
                        // Fail open: a cache entry of "disabled" means admitIP always allows.
                        Arc::new(vec![Rule::Disabled])
                    }
                }
            })
            .await
    }

    /// `admitIP(clientIP) -> {allow|deny}` (§4.1).
    pub async fn admit(&self, client_ip: IpAddr) -> bool {
        let normalized = normalize(client_ip);
        let rules = self.rules().await;
        if rules.iter().any(|r| matches!(r, Rule::Disabled)) {
            return true;
        }
        if rules.is_empty() {
            // No rules configured at all: fail open rather than lock everyone out.
            warn!("ip whitelist is empty; failing open");
            return true;
        }
        rules.iter().any(|rule| match rule {
            Rule::Disabled => true,
            Rule::Net(net) => net.contains(&normalized),
        })
    }

    /// Forces the next lookup to reload from the repository.
    pub async fn invalidate(&self) {
        self.cache.invalidate(&CACHE_KEY).await;
    }
}

/// Normalizes IPv6-mapped IPv4 (`::ffff:x.y.z.w`) and `::1` before
/// matching, as required by §4.1.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                IpAddr::V4(v4)
            } else if v6 == Ipv6Addr::LOCALHOST {
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
            } else {
                IpAddr::V6(v6)
            }
        }
        other => other,
    }
}

fn parse_rules(entries: &[String]) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(entries.len());
    for raw in entries {
        let raw = raw.trim();
        if raw == "0.0.0.0/0" {
            rules.push(Rule::Disabled);
            continue;
        }
        if let Ok(net) = raw.parse::<IpNet>() {
            rules.push(Rule::Net(net));
            continue;
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            if let Ok(net) = IpNet::new(ip, prefix) {
                rules.push(Rule::Net(net));
                continue;
            }
        }
        warn!(entry = raw, "ignoring unparseable ip whitelist entry");
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::in_memory::InMemoryProxyRepository;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn disabled_entry_allows_everything() {
        let wl = IpWhitelist::new(Arc::new(InMemoryProxyRepository::disabled()));
        assert!(wl.admit(ip("8.8.8.8")).await);
    }

    #[tokio::test]
    async fn exact_match_allows() {
        let repo = InMemoryProxyRepository::new(vec!["10.0.0.5".to_string()]);
        let wl = IpWhitelist::new(Arc::new(repo));
        assert!(wl.admit(ip("10.0.0.5")).await);
        assert!(!wl.admit(ip("10.0.0.6")).await);
    }

    #[tokio::test]
    async fn cidr_match_allows_range() {
        let repo = InMemoryProxyRepository::new(vec!["192.168.1.0/24".to_string()]);
        let wl = IpWhitelist::new(Arc::new(repo));
        assert!(wl.admit(ip("192.168.1.200")).await);
        assert!(!wl.admit(ip("192.168.2.1")).await);
    }

    #[test]
    fn normalizes_ipv4_mapped_ipv6() {
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert_eq!(normalize(mapped), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn normalizes_loopback_v6() {
        let loopback: IpAddr = "::1".parse().unwrap();
        assert_eq!(normalize(loopback), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }
}
