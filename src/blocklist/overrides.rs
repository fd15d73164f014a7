//! Answer overrides, consulted only when the blocklist did not block.
//!
//! Two independent mappings: domain to a fixed address, and domain to a
//! replacement canonical name. Reads take the shared side of the lock;
//! only a configuration reload writes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

fn canonical(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

#[derive(Default)]
pub struct Overrides {
    ips: RwLock<HashMap<String, IpAddr>>,
    cnames: RwLock<HashMap<String, String>>,
}

impl Overrides {
    pub fn new() -> Overrides {
        Overrides::default()
    }

    pub fn set_ip(&self, domain: &str, addr: IpAddr) {
        if let Ok(mut ips) = self.ips.write() {
            ips.insert(canonical(domain), addr);
        }
    }

    pub fn set_cname(&self, domain: &str, target: &str) {
        if let Ok(mut cnames) = self.cnames.write() {
            cnames.insert(canonical(domain), canonical(target));
        }
    }

    /// Swaps in a complete override table, e.g. on config reload.
    pub fn replace_all(&self, ips: HashMap<String, IpAddr>, cnames: HashMap<String, String>) {
        if let Ok(mut table) = self.ips.write() {
            *table = ips
                .into_iter()
                .map(|(domain, addr)| (canonical(&domain), addr))
                .collect();
        }
        if let Ok(mut table) = self.cnames.write() {
            *table = cnames
                .into_iter()
                .map(|(domain, target)| (canonical(&domain), canonical(&target)))
                .collect();
        }
    }

    pub fn lookup_ip(&self, domain: &str) -> Option<IpAddr> {
        self.ips.read().ok()?.get(&canonical(domain)).copied()
    }

    pub fn lookup_cname(&self, domain: &str) -> Option<String> {
        self.cnames.read().ok()?.get(&canonical(domain)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        let ips_empty = self.ips.read().map(|t| t.is_empty()).unwrap_or(true);
        let cnames_empty = self.cnames.read().map(|t| t.is_empty()).unwrap_or(true);
        ips_empty && cnames_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_override_roundtrip() {
        let overrides = Overrides::new();
        overrides.set_ip("pinned.example", "10.0.0.5".parse().unwrap());

        assert_eq!(
            overrides.lookup_ip("Pinned.Example."),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(overrides.lookup_ip("other.example"), None);
    }

    #[test]
    fn test_cname_override_roundtrip() {
        let overrides = Overrides::new();
        overrides.set_cname("alias.example", "Real.Example.");

        assert_eq!(
            overrides.lookup_cname("alias.example"),
            Some("real.example".to_string())
        );
    }

    #[test]
    fn test_replace_all_swaps_tables() {
        let overrides = Overrides::new();
        overrides.set_ip("old.example", "10.0.0.1".parse().unwrap());

        let mut ips = HashMap::new();
        ips.insert("new.example".to_string(), "10.0.0.2".parse().unwrap());
        overrides.replace_all(ips, HashMap::new());

        assert_eq!(overrides.lookup_ip("old.example"), None);
        assert!(overrides.lookup_ip("new.example").is_some());
    }
}
