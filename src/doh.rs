use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use log::{debug, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;

pub const DEFAULT_RESOLVER_URL: &str = "https://dns.alidns.com/resolve";
pub const DEFAULT_ECS_SUBNET: &str = "110.242.68.0/24";

pub const QTYPE_A: u16 = 1;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_TTL: Duration = Duration::from_secs(60);
const MAX_TTL: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
pub struct DohResponse {
    #[serde(rename = "Status")]
    pub status: u32,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DohAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohAnswer {
    #[serde(rename = "type")]
    pub record_type: u16,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
}

impl DohResponse {
    /// The first A record, if any.
    pub fn first_a_record(&self) -> Option<Ipv4Addr> {
        self.answer
            .iter()
            .filter(|a| a.record_type == QTYPE_A)
            .find_map(|a| a.data.parse::<Ipv4Addr>().ok())
    }
}

struct CacheEntry {
    response: DohResponse,
    expires_at: Instant,
}

/// DNS-over-HTTPS client speaking the JSON (`application/dns-json`) dialect,
/// with a TTL-clamped response cache. The HTTP client is built once and
/// pinned to the original egress interface so resolver traffic never loops
/// back through the tunnel.
pub struct DohClient {
    client: reqwest::Client,
    resolver_url: String,
    ecs_subnet: String,
    cache: RwLock<FxHashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("resolver_url", &self.resolver_url)
            .field("ecs_subnet", &self.ecs_subnet)
            .finish()
    }
}

impl DohClient {
    pub fn new(ecs_subnet: Option<String>, local_address: Option<IpAddr>) -> std::io::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .pool_max_idle_per_host(10)
            .no_proxy();
        if let Some(ip) = local_address {
            builder = builder.local_address(ip);
        }
        let client = builder
            .build()
            .map_err(|e| std::io::Error::other(format!("failed to create DoH client: {}", e)))?;

        let ecs_subnet = match ecs_subnet {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => DEFAULT_ECS_SUBNET.to_string(),
        };

        Ok(Self {
            client,
            resolver_url: DEFAULT_RESOLVER_URL.to_string(),
            ecs_subnet,
            cache: RwLock::new(FxHashMap::default()),
        })
    }

    /// Queries an A record with the configured EDNS client subnet hint.
    /// Cached responses are served until their clamped TTL expires.
    pub async fn query_a(&self, name: &str) -> std::io::Result<DohResponse> {
        self.query(name, QTYPE_A).await
    }

    pub async fn query(&self, name: &str, qtype: u16) -> std::io::Result<DohResponse> {
        let cache_key = format!("{}:{}:{}", name, qtype, self.ecs_subnet);

        if let Some(entry) = self.cache.read().get(&cache_key) {
            if Instant::now() < entry.expires_at {
                return Ok(entry.response.clone());
            }
        }

        let qtype_str = qtype.to_string();
        let response = self
            .client
            .get(&self.resolver_url)
            .query(&[
                ("name", name),
                ("type", qtype_str.as_str()),
                ("edns_client_subnet", self.ecs_subnet.as_str()),
            ])
            .header("Accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| std::io::Error::other(format!("DoH request failed: {}", e)))?;

        let response: DohResponse = response
            .json()
            .await
            .map_err(|e| std::io::Error::other(format!("DoH response parse failed: {}", e)))?;

        if response.status != 0 {
            return Err(std::io::Error::other(format!(
                "DoH resolver returned status {} for {}",
                response.status, name
            )));
        }

        let ttl = response
            .answer
            .first()
            .map(|a| Duration::from_secs(u64::from(a.ttl)))
            .unwrap_or(MIN_TTL)
            .clamp(MIN_TTL, MAX_TTL);

        debug!("DoH resolved {} (type {}): {:?}", name, qtype, response.answer);

        self.cache.write().insert(
            cache_key,
            CacheEntry {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(response)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.expires_at > now);
        let removed = before - cache.len();
        if removed > 0 {
            debug!("DoH cache sweep removed {} expired entries", removed);
        }
    }

    /// Periodic removal of expired cache entries. Runs until the client is
    /// dropped by every other holder.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match this.upgrade() {
                    Some(client) => client.sweep(),
                    None => break,
                }
            }
        })
    }

    #[cfg(test)]
    fn insert_for_test(&self, key: &str, response: DohResponse, ttl: Duration) {
        let ttl = ttl.clamp(MIN_TTL, MAX_TTL);
        self.cache.write().insert(
            key.to_string(),
            CacheEntry {
                response,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    #[cfg(test)]
    fn get_for_test(&self, key: &str) -> Option<DohResponse> {
        let cache = self.cache.read();
        let entry = cache.get(key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.response.clone())
        } else {
            None
        }
    }
}

/// Resolves a hostname to its first A record, used by the routing decision.
/// Any failure is reported to the caller, which falls back to a direct
/// connection; resolver errors are never fatal.
pub async fn resolve_first_a(client: &DohClient, name: &str) -> std::io::Result<Option<Ipv4Addr>> {
    match client.query_a(name).await {
        Ok(response) => Ok(response.first_a_record()),
        Err(e) => {
            warn!("DoH lookup for {} failed: {}", name, e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(ip: &str, ttl: u32) -> DohResponse {
        DohResponse {
            status: 0,
            answer: vec![DohAnswer {
                record_type: QTYPE_A,
                data: ip.to_string(),
                ttl,
            }],
        }
    }

    #[test]
    fn test_first_a_record_skips_cnames() {
        let response = DohResponse {
            status: 0,
            answer: vec![
                DohAnswer {
                    record_type: 5,
                    data: "alias.example.com.".to_string(),
                    ttl: 300,
                },
                DohAnswer {
                    record_type: QTYPE_A,
                    data: "1.2.3.4".to_string(),
                    ttl: 300,
                },
            ],
        };
        assert_eq!(
            response.first_a_record(),
            Some(Ipv4Addr::new(1, 2, 3, 4))
        );
    }

    #[test]
    fn test_no_a_record() {
        let response = DohResponse {
            status: 0,
            answer: vec![],
        };
        assert_eq!(response.first_a_record(), None);
    }

    #[tokio::test]
    async fn test_cache_get_within_ttl() {
        let client = DohClient::new(None, None).unwrap();
        client.insert_for_test(
            "foo.example:1:110.242.68.0/24",
            response_with("9.9.9.9", 300),
            Duration::from_secs(300),
        );
        let cached = client.get_for_test("foo.example:1:110.242.68.0/24").unwrap();
        assert_eq!(cached.first_a_record(), Some(Ipv4Addr::new(9, 9, 9, 9)));
        assert!(client.get_for_test("other.example:1:110.242.68.0/24").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_clamped_to_minimum() {
        let client = DohClient::new(None, None).unwrap();
        // A 1-second TTL must be clamped up to 60 seconds.
        client.insert_for_test(
            "short.example:1:110.242.68.0/24",
            response_with("9.9.9.9", 1),
            Duration::from_secs(1),
        );

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(client.get_for_test("short.example:1:110.242.68.0/24").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(client.get_for_test("short.example:1:110.242.68.0/24").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_clamped_to_maximum() {
        let client = DohClient::new(None, None).unwrap();
        client.insert_for_test(
            "long.example:1:110.242.68.0/24",
            response_with("9.9.9.9", 86400),
            Duration::from_secs(86400),
        );

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(client.get_for_test("long.example:1:110.242.68.0/24").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(client.get_for_test("long.example:1:110.242.68.0/24").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let client = DohClient::new(None, None).unwrap();
        client.insert_for_test(
            "a:1:x",
            response_with("1.1.1.1", 60),
            Duration::from_secs(60),
        );
        client.insert_for_test(
            "b:1:x",
            response_with("2.2.2.2", 3600),
            Duration::from_secs(3600),
        );
        assert_eq!(client.cache_len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        client.sweep();
        assert_eq!(client.cache_len(), 1);
    }
}
