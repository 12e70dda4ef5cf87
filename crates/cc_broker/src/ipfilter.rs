//! Accept-time IP filtering.
//!
//! Two durable lists (blacklist, whitelist), each holding explicit
//! addresses plus CIDR networks, and a transient temp-ban map. Evaluation
//! order at accept: active temp ban → blacklist → whitelist mode.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persist::{load_json, write_json_atomic};

#[derive(Debug, Default, Serialize, Deserialize)]
struct FilterFile {
    #[serde(default)]
    ips: BTreeSet<IpAddr>,
    #[serde(default)]
    networks: Vec<IpNet>,
}

pub struct IpFilter {
    blacklist_path: PathBuf,
    whitelist_path: PathBuf,
    whitelist_mode: bool,
    blacklist: FilterFile,
    whitelist: FilterFile,
    temp_bans: HashMap<IpAddr, Instant>,
}

impl IpFilter {
    pub fn load(blacklist_path: PathBuf, whitelist_path: PathBuf, whitelist_mode: bool) -> Self {
        let blacklist = load_json(&blacklist_path).unwrap_or_default();
        let whitelist = load_json(&whitelist_path).unwrap_or_default();
        Self {
            blacklist_path,
            whitelist_path,
            whitelist_mode,
            blacklist,
            whitelist,
            temp_bans: HashMap::new(),
        }
    }

    /// Evaluate an address at accept time. Expired temp bans are removed
    /// lazily here.
    pub fn is_allowed(&mut self, ip: IpAddr) -> bool {
        if let Some(expiry) = self.temp_bans.get(&ip) {
            if Instant::now() < *expiry {
                return false;
            }
            self.temp_bans.remove(&ip);
        }
        if Self::matches(&self.blacklist, ip) {
            return false;
        }
        if self.whitelist_mode {
            return Self::matches(&self.whitelist, ip);
        }
        true
    }

    fn matches(list: &FilterFile, ip: IpAddr) -> bool {
        list.ips.contains(&ip) || list.networks.iter().any(|net| net.contains(&ip))
    }

    /// Add an address or CIDR network to the blacklist. Durable.
    pub fn add_to_blacklist(&mut self, entry: &str) -> bool {
        if Self::add_entry(&mut self.blacklist, entry) {
            self.save_blacklist();
            return true;
        }
        false
    }

    pub fn remove_from_blacklist(&mut self, entry: &str) -> bool {
        if Self::remove_entry(&mut self.blacklist, entry) {
            self.save_blacklist();
            return true;
        }
        false
    }

    pub fn add_to_whitelist(&mut self, entry: &str) -> bool {
        if Self::add_entry(&mut self.whitelist, entry) {
            self.save_whitelist();
            return true;
        }
        false
    }

    pub fn remove_from_whitelist(&mut self, entry: &str) -> bool {
        if Self::remove_entry(&mut self.whitelist, entry) {
            self.save_whitelist();
            return true;
        }
        false
    }

    pub fn clear_blacklist(&mut self) {
        self.blacklist = FilterFile::default();
        self.save_blacklist();
    }

    pub fn clear_whitelist(&mut self) {
        self.whitelist = FilterFile::default();
        self.save_whitelist();
    }

    pub fn temp_ban(&mut self, ip: IpAddr, duration: Duration) {
        self.temp_bans.insert(ip, Instant::now() + duration);
    }

    pub fn remove_temp_ban(&mut self, ip: IpAddr) {
        self.temp_bans.remove(&ip);
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.ips.len() + self.blacklist.networks.len()
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.ips.len() + self.whitelist.networks.len()
    }

    fn add_entry(list: &mut FilterFile, entry: &str) -> bool {
        if entry.contains('/') {
            match entry.parse::<IpNet>() {
                Ok(net) if !list.networks.contains(&net) => {
                    list.networks.push(net);
                    true
                }
                _ => false,
            }
        } else {
            match entry.parse::<IpAddr>() {
                Ok(ip) => list.ips.insert(ip),
                Err(_) => false,
            }
        }
    }

    fn remove_entry(list: &mut FilterFile, entry: &str) -> bool {
        if entry.contains('/') {
            match entry.parse::<IpNet>() {
                Ok(net) => {
                    let before = list.networks.len();
                    list.networks.retain(|n| *n != net);
                    list.networks.len() != before
                }
                Err(_) => false,
            }
        } else {
            match entry.parse::<IpAddr>() {
                Ok(ip) => list.ips.remove(&ip),
                Err(_) => false,
            }
        }
    }

    fn save_blacklist(&self) {
        if let Err(e) = write_json_atomic(&self.blacklist_path, &self.blacklist) {
            warn!(error = %e, "failed to save IP blacklist");
        }
    }

    fn save_whitelist(&self) {
        if let Err(e) = write_json_atomic(&self.whitelist_path, &self.whitelist) {
            warn!(error = %e, "failed to save IP whitelist");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(whitelist_mode: bool) -> (IpFilter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let f = IpFilter::load(
            dir.path().join("ip_blacklist.json"),
            dir.path().join("ip_whitelist.json"),
            whitelist_mode,
        );
        (f, dir)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn default_allows_everyone() {
        let (mut f, _d) = filter(false);
        assert!(f.is_allowed(ip("10.0.0.1")));
    }

    #[test]
    fn blacklisted_address_denied() {
        let (mut f, _d) = filter(false);
        assert!(f.add_to_blacklist("10.0.0.1"));
        assert!(!f.is_allowed(ip("10.0.0.1")));
        assert!(f.is_allowed(ip("10.0.0.2")));
    }

    #[test]
    fn blacklisted_network_denied() {
        let (mut f, _d) = filter(false);
        assert!(f.add_to_blacklist("192.168.0.0/16"));
        assert!(!f.is_allowed(ip("192.168.44.7")));
        assert!(f.is_allowed(ip("192.169.0.1")));
    }

    #[test]
    fn whitelist_mode_denies_unlisted() {
        let (mut f, _d) = filter(true);
        assert!(f.add_to_whitelist("172.16.0.0/12"));
        assert!(f.is_allowed(ip("172.16.5.5")));
        assert!(!f.is_allowed(ip("8.8.8.8")));
    }

    #[test]
    fn temp_ban_beats_whitelist() {
        let (mut f, _d) = filter(true);
        f.add_to_whitelist("172.16.0.1");
        f.temp_ban(ip("172.16.0.1"), Duration::from_secs(300));
        assert!(!f.is_allowed(ip("172.16.0.1")));
        f.remove_temp_ban(ip("172.16.0.1"));
        assert!(f.is_allowed(ip("172.16.0.1")));
    }

    #[test]
    fn invalid_entries_rejected() {
        let (mut f, _d) = filter(false);
        assert!(!f.add_to_blacklist("not-an-ip"));
        assert!(!f.add_to_blacklist("300.1.2.3/99"));
        assert_eq!(f.blacklist_len(), 0);
    }

    #[test]
    fn mutations_are_durable() {
        let dir = tempfile::tempdir().unwrap();
        let bl = dir.path().join("ip_blacklist.json");
        let wl = dir.path().join("ip_whitelist.json");
        {
            let mut f = IpFilter::load(bl.clone(), wl.clone(), false);
            f.add_to_blacklist("10.1.0.0/24");
            f.add_to_blacklist("10.9.9.9");
        }
        let mut reloaded = IpFilter::load(bl, wl, false);
        assert!(!reloaded.is_allowed(ip("10.1.0.200")));
        assert!(!reloaded.is_allowed(ip("10.9.9.9")));
        assert_eq!(reloaded.blacklist_len(), 2);

        reloaded.clear_blacklist();
        assert!(reloaded.is_allowed(ip("10.9.9.9")));
    }
}
