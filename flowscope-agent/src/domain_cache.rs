//! DNS answers observed on the node, indexed by resolved address

use dashmap::DashMap;
use flowscope::lookup::{EgressDomainCache, GLOBAL_CLIENT};
use flowscope_common::to_16_bytes;
use std::net::IpAddr;
use std::sync::Arc;

/// Thread-safe map from resolved addresses to the names that produced them
#[derive(Clone, Default)]
pub struct DomainCache {
    watched: Arc<DashMap<[u8; 16], String>>,
    watched_domains: Arc<DashMap<String, ()>>,
    answers: Arc<DashMap<(String, [u8; 16]), Vec<String>>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domains named in egress policy. Answers for these are also indexed
    /// for [`EgressDomainCache::get_watched_domain_for_ip`].
    pub fn watch(&self, domain: &str) {
        self.watched_domains.insert(domain.to_ascii_lowercase(), ());
    }

    /// Record that `client` looked up `domain` and got `addr` back. The
    /// answer is indexed for the client and for the global view.
    pub fn record_answer(&self, client: IpAddr, domain: &str, addr: IpAddr) {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let addr = to_16_bytes(addr);
        if self.watched_domains.contains_key(&domain) {
            self.watched.insert(addr, domain.clone());
        }
        for key in [client.to_string(), GLOBAL_CLIENT.to_string()] {
            let mut names = self.answers.entry((key, addr)).or_default();
            if !names.contains(&domain) {
                names.push(domain.clone());
            }
        }
    }

    /// Drop every answer for `addr`, typically when its TTL ran out.
    pub fn expire(&self, addr: IpAddr) {
        let addr = to_16_bytes(addr);
        self.watched.remove(&addr);
        self.answers.retain(|(_, a), _| *a != addr);
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

impl EgressDomainCache for DomainCache {
    fn get_watched_domain_for_ip(&self, addr: &[u8; 16]) -> Option<String> {
        self.watched.get(addr).map(|r| r.value().clone())
    }

    fn get_top_level_domains_for_ip(&self, client: &str, addr: &[u8; 16]) -> Vec<String> {
        self.answers
            .get(&(client.to_string(), *addr))
            .map(|names| names.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("Should parse address")
    }

    #[test]
    fn test_answers_indexed_per_client_and_globally() {
        let cache = DomainCache::new();
        cache.record_answer(ip("10.0.0.1"), "Example.com.", ip("93.184.216.34"));
        cache.record_answer(ip("10.0.0.1"), "example.com", ip("93.184.216.34"));
        cache.record_answer(ip("10.0.0.2"), "www.example.com", ip("93.184.216.34"));

        let dst = to_16_bytes(ip("93.184.216.34"));
        assert_eq!(cache.get_top_level_domains_for_ip("10.0.0.1", &dst), vec!["example.com"]);
        assert_eq!(
            cache.get_top_level_domains_for_ip(GLOBAL_CLIENT, &dst),
            vec!["example.com", "www.example.com"]
        );
        assert!(cache.get_top_level_domains_for_ip("10.0.0.9", &dst).is_empty());
        assert!(cache.get_watched_domain_for_ip(&dst).is_none());
    }

    #[test]
    fn test_watched_domains_and_expiry() {
        let cache = DomainCache::new();
        cache.watch("api.example.com");
        cache.record_answer(ip("10.0.0.1"), "api.example.com", ip("1.2.3.4"));
        cache.record_answer(ip("10.0.0.1"), "other.example.com", ip("1.2.3.5"));

        let watched = to_16_bytes(ip("1.2.3.4"));
        assert_eq!(cache.get_watched_domain_for_ip(&watched).as_deref(), Some("api.example.com"));
        assert!(cache.get_watched_domain_for_ip(&to_16_bytes(ip("1.2.3.5"))).is_none());

        cache.expire(ip("1.2.3.4"));
        assert!(cache.get_watched_domain_for_ip(&watched).is_none());
        assert!(cache.get_top_level_domains_for_ip(GLOBAL_CLIENT, &watched).is_empty());
        assert_eq!(cache.len(), 2);
    }
}
