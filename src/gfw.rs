use std::path::Path;

use log::info;
use rustc_hash::FxHashSet;

/// Blocklist matcher over the decoded AutoProxy rule format used by the
/// hosted GFW list. Supported rule forms:
///
/// - `||example.com`   - domain and all subdomains
/// - `|http://foo`     - URL prefix
/// - `keyword`         - substring of the URL
/// - `@@...`           - exception (never blocked), same forms as above
/// - `!...` and `[...]` - comments / section markers, ignored
///
/// List download and refresh happen elsewhere; this consumes a local file.
#[derive(Debug, Default)]
pub struct GfwList {
    blocked_domains: FxHashSet<String>,
    blocked_prefixes: Vec<String>,
    blocked_keywords: Vec<String>,
    allowed_domains: FxHashSet<String>,
    allowed_prefixes: Vec<String>,
}

impl GfwList {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_lines(&contents))
    }

    pub fn from_lines(contents: &str) -> Self {
        let mut list = GfwList::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }

            let (line, exception) = match line.strip_prefix("@@") {
                Some(rest) => (rest, true),
                None => (line, false),
            };

            if let Some(domain) = line.strip_prefix("||") {
                let domain = strip_path(domain).to_ascii_lowercase();
                if exception {
                    list.allowed_domains.insert(domain);
                } else {
                    list.blocked_domains.insert(domain);
                }
            } else if let Some(prefix) = line.strip_prefix('|') {
                if exception {
                    list.allowed_prefixes.push(prefix.to_string());
                } else {
                    list.blocked_prefixes.push(prefix.to_string());
                }
            } else if !exception {
                list.blocked_keywords.push(line.to_string());
            }
        }

        info!(
            "Loaded GFW list: {} domains, {} prefixes, {} keywords, {} exceptions",
            list.blocked_domains.len(),
            list.blocked_prefixes.len(),
            list.blocked_keywords.len(),
            list.allowed_domains.len() + list.allowed_prefixes.len(),
        );
        list
    }

    /// Checks a pseudo-request the way a browser request would be checked:
    /// `url` is `scheme://host/`, `host` is the bare hostname.
    pub fn is_blocked(&self, url: &str, host: &str) -> bool {
        let host = host.to_ascii_lowercase();

        if self.domain_in(&self.allowed_domains, &host)
            || self.allowed_prefixes.iter().any(|p| url.starts_with(p.as_str()))
        {
            return false;
        }

        if self.domain_in(&self.blocked_domains, &host) {
            return true;
        }

        if self.blocked_prefixes.iter().any(|p| url.starts_with(p.as_str())) {
            return true;
        }

        self.blocked_keywords.iter().any(|k| url.contains(k.as_str()))
    }

    fn domain_in(&self, set: &FxHashSet<String>, host: &str) -> bool {
        // ||example.com matches example.com and any subdomain.
        let mut rest = host;
        loop {
            if set.contains(rest) {
                return true;
            }
            match rest.find('.') {
                Some(i) => rest = &rest[i + 1..],
                None => return false,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_domains.is_empty()
            && self.blocked_prefixes.is_empty()
            && self.blocked_keywords.is_empty()
    }
}

fn strip_path(s: &str) -> &str {
    match s.find('/') {
        Some(i) => &s[..i],
        None => s,
    }
}
