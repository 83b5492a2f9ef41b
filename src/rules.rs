use std::net::{IpAddr, Ipv4Addr};

use log::warn;
use parking_lot::RwLock;

/// A single compiled routing rule. Rules come from the `white_list` /
/// `black_list` config entries and are matched against a target string
/// (host:port) and, when known, its IP.
#[derive(Debug, Clone)]
pub enum Rule {
    /// IP in subnet, e.g. `10.0.0.0/8`.
    Cidr { network: u128, netmask: u128, is_ipv4: bool },
    /// Inclusive IPv4 range in numeric order, e.g. `1.1.1.1-1.1.1.9`.
    IpRange { start: u32, end: u32 },
    /// `*.suffix` or `prefix.*`.
    DomainWildcard { pattern: String },
    /// Substring match on the whole target string.
    Substring { value: String },
}

impl Rule {
    /// Parses a rule string. Order matters: CIDR first, then IP range, then
    /// wildcard, with substring as the catch-all. Returns None for strings
    /// that fit no form (e.g. a malformed CIDR also containing no usable
    /// fallback) so a bad config line degrades to a warning, not a failure.
    pub fn parse(rule_str: &str) -> Option<Rule> {
        let rule_str = rule_str.trim();
        if rule_str.is_empty() {
            return None;
        }

        if rule_str.contains('/') {
            if let Some(rule) = parse_cidr(rule_str) {
                return Some(rule);
            }
        }

        if rule_str.contains('-') && !rule_str.contains('*') {
            let mut parts = rule_str.splitn(2, '-');
            let start = parts.next().unwrap_or("").trim().parse::<Ipv4Addr>();
            let end = parts.next().unwrap_or("").trim().parse::<Ipv4Addr>();
            if let (Ok(start), Ok(end)) = (start, end) {
                return Some(Rule::IpRange {
                    start: u32::from(start),
                    end: u32::from(end),
                });
            }
        }

        if rule_str.contains('*') {
            return Some(Rule::DomainWildcard {
                pattern: rule_str.to_string(),
            });
        }

        Some(Rule::Substring {
            value: rule_str.to_string(),
        })
    }

    /// Matches against the target string (host:port form) and its resolved
    /// IP if one is available. IP-based rules never match without an IP.
    pub fn matches(&self, target: &str, ip: Option<IpAddr>) -> bool {
        match self {
            Rule::Cidr {
                network,
                netmask,
                is_ipv4,
            } => match ip {
                Some(ip) => {
                    if *is_ipv4 != ip.is_ipv4() {
                        return false;
                    }
                    (ip_to_u128(ip) & netmask) == *network
                }
                None => false,
            },
            Rule::IpRange { start, end } => match ip {
                Some(IpAddr::V4(v4)) => {
                    let value = u32::from(v4);
                    value >= *start && value <= *end
                }
                _ => false,
            },
            Rule::DomainWildcard { pattern } => match_domain(target, pattern),
            Rule::Substring { value } => target.contains(value.as_str()),
        }
    }
}

fn parse_cidr(s: &str) -> Option<Rule> {
    let mut parts = s.splitn(2, '/');
    let addr = parts.next()?.trim();
    let bits = parts.next()?.trim().parse::<u8>().ok()?;

    match addr.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            if bits > 32 {
                return None;
            }
            let mask_u32: u32 = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            let netmask = u128::from(mask_u32);
            Some(Rule::Cidr {
                network: u128::from(u32::from(v4)) & netmask,
                netmask,
                is_ipv4: true,
            })
        }
        IpAddr::V6(v6) => {
            if bits > 128 {
                return None;
            }
            let netmask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            Some(Rule::Cidr {
                network: u128::from(v6) & netmask,
                netmask,
                is_ipv4: false,
            })
        }
    }
}

#[inline]
fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Wildcard domain match. The target may carry a port suffix; it is
/// stripped before comparison.
fn match_domain(target: &str, pattern: &str) -> bool {
    let domain = match target.rfind(':') {
        Some(i) if target[i + 1..].bytes().all(|b| b.is_ascii_digit()) => &target[..i],
        _ => target,
    };

    if pattern == domain {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{}", suffix));
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        return domain.starts_with(&format!("{}.", prefix));
    }

    // A '*' anywhere else degrades to a plain substring check.
    domain.contains(pattern.trim_matches('*'))
}

/// The compiled whitelist/blacklist pair. Lookups take a read lock; config
/// reload rebuilds both lists and swaps them under the write lock.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: RwLock<RuleLists>,
}

#[derive(Debug, Default)]
struct RuleLists {
    white: Vec<Rule>,
    black: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(white_list: &[String], black_list: &[String]) -> Self {
        let engine = Self::default();
        engine.load(white_list, black_list);
        engine
    }

    pub fn load(&self, white_list: &[String], black_list: &[String]) {
        let white = compile_rules(white_list);
        let black = compile_rules(black_list);
        let mut lists = self.rules.write();
        lists.white = white;
        lists.black = black;
    }

    pub fn is_white(&self, target: &str, ip: Option<IpAddr>) -> bool {
        self.rules
            .read()
            .white
            .iter()
            .any(|rule| rule.matches(target, ip))
    }

    pub fn is_black(&self, target: &str, ip: Option<IpAddr>) -> bool {
        self.rules
            .read()
            .black
            .iter()
            .any(|rule| rule.matches(target, ip))
    }

    /// Whitelist CIDR networks and IP-range starts, used by the route
    /// manager to install direct host routes. Ranges are approximated by a
    /// /32 at the range start; the in-process routing decision still honors
    /// the full range.
    pub fn white_networks(&self) -> Vec<(Ipv4Addr, u8)> {
        let lists = self.rules.read();
        let mut networks = Vec::new();
        for rule in lists.white.iter() {
            match rule {
                Rule::Cidr {
                    network,
                    netmask,
                    is_ipv4: true,
                } => {
                    let prefix_len = 32 - (*netmask as u32).trailing_zeros().min(32);
                    networks.push((Ipv4Addr::from(*network as u32), prefix_len as u8));
                }
                Rule::IpRange { start, .. } => {
                    networks.push((Ipv4Addr::from(*start), 32));
                }
                _ => {}
            }
        }
        networks
    }
}

fn compile_rules(rule_strs: &[String]) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(rule_strs.len());
    for rule_str in rule_strs {
        match Rule::parse(rule_str) {
            Some(rule) => rules.push(rule),
            None => {
                warn!("Ignoring unparseable rule: {}", rule_str);
            }
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_cidr_rule() {
        let rule = Rule::parse("192.168.1.0/24").unwrap();
        assert!(matches!(rule, Rule::Cidr { .. }));
        assert!(rule.matches("192.168.1.55:80", ip("192.168.1.55")));
        assert!(rule.matches("x", ip("192.168.1.1")));
        assert!(!rule.matches("x", ip("192.168.2.1")));
        assert!(!rule.matches("192.168.1.55:80", None));
    }

    #[test]
    fn test_cidr_boundaries() {
        let rule = Rule::parse("10.0.0.0/8").unwrap();
        assert!(rule.matches("", ip("10.0.0.0")));
        assert!(rule.matches("", ip("10.255.255.255")));
        assert!(!rule.matches("", ip("11.0.0.0")));
        assert!(!rule.matches("", ip("9.255.255.255")));
    }

    #[test]
    fn test_ip_range_rule() {
        let rule = Rule::parse("192.168.1.1-192.168.1.100").unwrap();
        assert!(matches!(rule, Rule::IpRange { .. }));
        assert!(rule.matches("", ip("192.168.1.1")));
        assert!(rule.matches("", ip("192.168.1.100")));
        assert!(rule.matches("", ip("192.168.1.50")));
        assert!(!rule.matches("", ip("192.168.1.101")));
        assert!(!rule.matches("", None));
    }

    #[test]
    fn test_wildcard_suffix_rule() {
        let rule = Rule::parse("*.example.com").unwrap();
        assert!(rule.matches("www.example.com:443", None));
        assert!(rule.matches("example.com:443", None));
        assert!(rule.matches("a.b.example.com", None));
        assert!(!rule.matches("badexample.com:443", None));
        assert!(!rule.matches("example.org:443", None));
    }

    #[test]
    fn test_wildcard_prefix_rule() {
        let rule = Rule::parse("internal.*").unwrap();
        assert!(rule.matches("internal.corp:8080", None));
        assert!(!rule.matches("external.corp:8080", None));
        assert!(!rule.matches("internal:8080", None));
    }

    #[test]
    fn test_substring_rule() {
        let rule = Rule::parse("tracker").unwrap();
        assert!(matches!(rule, Rule::Substring { .. }));
        assert!(rule.matches("ads.tracker.net:80", None));
        assert!(!rule.matches("example.com:80", None));
    }

    #[test]
    fn test_dash_with_star_is_not_a_range() {
        let rule = Rule::parse("*.some-site.com").unwrap();
        assert!(matches!(rule, Rule::DomainWildcard { .. }));
        assert!(rule.matches("cdn.some-site.com:443", None));
    }

    #[test]
    fn test_engine_white_and_black() {
        let engine = RuleEngine::new(
            &["10.0.0.0/8".to_string()],
            &["10.5.5.5/32".to_string(), "*.blocked.com".to_string()],
        );
        assert!(engine.is_white("10.5.5.5:80", ip("10.5.5.5")));
        assert!(engine.is_black("10.5.5.5:80", ip("10.5.5.5")));
        assert!(engine.is_black("www.blocked.com:443", None));
        assert!(!engine.is_white("1.2.3.4:80", ip("1.2.3.4")));
    }

    #[test]
    fn test_engine_reload_swaps_rules() {
        let engine = RuleEngine::new(&["*.old.com".to_string()], &[]);
        assert!(engine.is_white("a.old.com:80", None));
        engine.load(&["*.new.com".to_string()], &[]);
        assert!(!engine.is_white("a.old.com:80", None));
        assert!(engine.is_white("a.new.com:80", None));
    }

    #[test]
    fn test_white_networks_for_routes() {
        let engine = RuleEngine::new(
            &[
                "172.16.0.0/12".to_string(),
                "1.1.1.1-1.1.1.9".to_string(),
                "*.example.com".to_string(),
            ],
            &[],
        );
        let networks = engine.white_networks();
        assert_eq!(networks.len(), 2);
        assert!(networks.contains(&(Ipv4Addr::new(172, 16, 0, 0), 12)));
        assert!(networks.contains(&(Ipv4Addr::new(1, 1, 1, 1), 32)));
    }
}
