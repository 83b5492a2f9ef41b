use std::net::IpAddr;

use log::debug;

use crate::address::Target;
use crate::config::OutKind;
use crate::doh;
use crate::services::Services;

/// The egress flavor selected for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Direct,
    Tls,
    Wss,
}

fn tunnel_kind(out_kind: OutKind) -> RemoteKind {
    match out_kind {
        OutKind::Tls => RemoteKind::Tls,
        OutKind::Wss => RemoteKind::Wss,
        OutKind::Direct => RemoteKind::Direct,
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Decides whether a target is reached directly or through the tunnel.
/// First match wins:
///
/// 1. direct egress mode
/// 2. whitelist
/// 3. blacklist
/// 4. hostname targets: GFW list, `.cn` suffix, then a DoH lookup whose
///    answer is classified like a literal IP (resolver failure means direct)
/// 5. IP targets: loopback/private/country-index short-circuit to direct
pub async fn pick_remote_kind(target: &Target, services: &Services) -> RemoteKind {
    let out_kind = services.out_kind();
    if out_kind == OutKind::Direct {
        return RemoteKind::Direct;
    }

    let target_str = target.to_string();
    let target_ip = target.location.address().ip();

    if services.rules.is_white(&target_str, target_ip) {
        debug!("{} matched whitelist", target_str);
        return RemoteKind::Direct;
    }

    if services.rules.is_black(&target_str, target_ip) {
        debug!("{} matched blacklist", target_str);
        return tunnel_kind(out_kind);
    }

    match target_ip {
        None => {
            let host = target.host();
            let scheme = if target.location.port() == 443 {
                "https"
            } else {
                "http"
            };
            let url = format!("{}://{}/", scheme, host);

            if services.gfw.is_blocked(&url, &host) {
                debug!("{} blocked by GFW list", target_str);
                return tunnel_kind(out_kind);
            }

            if host.ends_with(".cn") {
                return RemoteKind::Direct;
            }

            match doh::resolve_first_a(&services.doh, &host).await {
                Ok(Some(ip)) => {
                    if is_local_ip(IpAddr::V4(ip)) || services.country_ips.contains(ip) {
                        debug!("{} resolved to {} -> direct", target_str, ip);
                        RemoteKind::Direct
                    } else {
                        debug!("{} resolved to {} -> tunnel", target_str, ip);
                        tunnel_kind(out_kind)
                    }
                }
                // No A record, or the resolver failed: connecting directly
                // is the only option that can still succeed.
                Ok(None) | Err(_) => RemoteKind::Direct,
            }
        }
        Some(ip) => {
            let country_hit = match ip {
                IpAddr::V4(v4) => services.country_ips.contains(v4),
                IpAddr::V6(_) => false,
            };
            if is_local_ip(ip) || country_hit {
                RemoteKind::Direct
            } else {
                tunnel_kind(out_kind)
            }
        }
    }
}
