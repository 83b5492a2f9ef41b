use std::sync::Arc;

use parking_lot::RwLock;

use crate::binder::InterfaceBinder;
use crate::cipher_stream::KEY_LEN;
use crate::config::{Config, OutKind};
use crate::country_ip::CountryIpList;
use crate::doh::DohClient;
use crate::gfw::GfwList;
use crate::rules::RuleEngine;

/// The shared service container. Everything the original modeled as a
/// process-wide singleton lives here and is passed explicitly through
/// constructors; config reload swaps the config slot and rebuilds the rule
/// engine in place.
pub struct Services {
    config: RwLock<Arc<Config>>,
    pub rules: RuleEngine,
    pub country_ips: CountryIpList,
    pub gfw: GfwList,
    pub doh: Arc<DohClient>,
    pub binder: Arc<InterfaceBinder>,
}

impl Services {
    pub fn new(
        config: Config,
        country_ips: CountryIpList,
        gfw: GfwList,
        doh: Arc<DohClient>,
        binder: Arc<InterfaceBinder>,
    ) -> Self {
        let rules = RuleEngine::new(&config.white_list, &config.black_list);
        Self {
            config: RwLock::new(Arc::new(config)),
            rules,
            country_ips,
            gfw,
            doh,
            binder,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn out_kind(&self) -> OutKind {
        self.config().outbound.out_kind().unwrap_or(OutKind::Direct)
    }

    pub fn remote_addr(&self) -> String {
        self.config().outbound.remote_addr.clone()
    }

    pub fn cipher_key(&self) -> [u8; KEY_LEN] {
        self.config().cipher_key()
    }

    /// Applies a reloaded config: swaps the config slot and rebuilds the
    /// rule lists atomically. File-backed tables (country IPs, GFW list)
    /// keep their load-time contents.
    pub fn apply_config(&self, config: Config) {
        self.rules.load(&config.white_list, &config.black_list);
        *self.config.write() = Arc::new(config);
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config.read())
            .finish()
    }
}

#[cfg(test)]
pub fn test_services(config: Config) -> Arc<Services> {
    Arc::new(Services::new(
        config,
        CountryIpList::default(),
        GfwList::default(),
        Arc::new(DohClient::new(None, None).unwrap()),
        Arc::new(InterfaceBinder::new()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_swaps_rules_and_config() {
        let mut config = Config::default();
        config.white_list = vec!["*.old.com".to_string()];
        let services = test_services(config);

        assert!(services.rules.is_white("a.old.com:80", None));

        let mut new_config = Config::default();
        new_config.white_list = vec!["*.new.com".to_string()];
        new_config.outbound.kind = 3;
        services.apply_config(new_config);

        assert!(!services.rules.is_white("a.old.com:80", None));
        assert!(services.rules.is_white("a.new.com:80", None));
        assert_eq!(services.out_kind(), OutKind::Direct);
    }
}
