use std::net::Ipv4Addr;
use std::path::Path;

use log::{info, warn};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
struct IpRange {
    min: u32,
    max: u32,
}

/// IPv4 ranges assigned to the target country, bucketed by first octet so a
/// lookup only scans the handful of ranges sharing that octet. Loaded once
/// from a CIDR-per-line file and immutable afterwards.
#[derive(Debug, Default)]
pub struct CountryIpList {
    buckets: FxHashMap<u8, Vec<IpRange>>,
}

impl CountryIpList {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_lines(&contents))
    }

    pub fn from_lines(contents: &str) -> Self {
        let mut buckets: FxHashMap<u8, Vec<IpRange>> = FxHashMap::default();
        let mut count = 0usize;

        for (line_number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(range) = parse_cidr_range(line) else {
                warn!("Ignoring line {}: not an ipv4 CIDR", line_number + 1);
                continue;
            };

            let first_octet = (range.min >> 24) as u8;
            buckets.entry(first_octet).or_default().push(range);
            count += 1;
        }

        for ranges in buckets.values_mut() {
            ranges.sort_by_key(|r| r.min);
        }

        info!("Loaded {} country IP ranges", count);
        Self { buckets }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let value = u32::from(ip);
        let first_octet = ip.octets()[0];
        match self.buckets.get(&first_octet) {
            Some(ranges) => ranges
                .iter()
                .any(|range| value >= range.min && value <= range.max),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn parse_cidr_range(line: &str) -> Option<IpRange> {
    let mut parts = line.splitn(2, '/');
    let addr = parts.next()?.parse::<Ipv4Addr>().ok()?;
    let bits = parts.next()?.trim().parse::<u8>().ok()?;
    if bits > 32 {
        return None;
    }

    let mask: u32 = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    let min = u32::from(addr) & mask;
    let max = min | !mask;
    Some(IpRange { min, max })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_matches_source_cidrs() {
        let list = CountryIpList::from_lines(
            "# comment\n\n114.114.0.0/16\n1.0.1.0/24\n223.255.252.0/22\n",
        );

        assert!(list.contains(Ipv4Addr::new(114, 114, 114, 114)));
        assert!(list.contains(Ipv4Addr::new(114, 114, 0, 0)));
        assert!(list.contains(Ipv4Addr::new(114, 114, 255, 255)));
        assert!(!list.contains(Ipv4Addr::new(114, 115, 0, 0)));

        assert!(list.contains(Ipv4Addr::new(1, 0, 1, 200)));
        assert!(!list.contains(Ipv4Addr::new(1, 0, 2, 0)));

        assert!(list.contains(Ipv4Addr::new(223, 255, 255, 255)));
        assert!(!list.contains(Ipv4Addr::new(223, 255, 251, 255)));
    }

    #[test]
    fn test_bad_lines_skipped() {
        let list = CountryIpList::from_lines("not-a-cidr\n10.0.0.0/33\n8.8.0.0/16\n");
        assert!(list.contains(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!list.contains(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_empty_list() {
        let list = CountryIpList::from_lines("");
        assert!(list.is_empty());
        assert!(!list.contains(Ipv4Addr::new(1, 2, 3, 4)));
    }
}
