use std::fs;
use std::path::Path;

use ipnet::Ipv4Net;

use super::error::{PnaError, Result};

// MONITORED NETWORK SET
//
// The set of networks whose hosts count as "local". Built once at startup
// from a networks file (one CIDR per line) and/or the configured single
// prefix; afterwards the hot path only ever asks is_local().
//
//   NetSet - list of (prefix, mask) pairs in host order
//   build(path) -> Result<NetSet> - parse a networks file
//   add(Ipv4Net) / add_prefix(u32, u32) - extend the set
//   is_local(u32) -> bool - membership test
//
// This is the flat stand-in for the longest-prefix-match trie; membership
// is all the analyzer needs from it.

#[derive(Clone, Debug, Default)]
pub struct NetSet {
    nets: Vec<(u32, u32)> // (masked prefix, mask), host order
}

impl NetSet {

    pub fn new() -> NetSet {
        NetSet { nets: Vec::new() }
    }

    pub fn build(path: &Path) -> Result<NetSet> {
        let text = fs::read_to_string(path).map_err(|source| {
            PnaError::NetworksIo { path: path.to_path_buf(), source }
        })?;
        let mut set = NetSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue; }
            let net: Ipv4Net = line.parse().map_err(|_| {
                PnaError::NetworksParse {
                    path: path.to_path_buf(),
                    line: line.to_string()
                }
            })?;
            set.add(net);
        }
        Ok(set)
    }

    pub fn add(&mut self, net: Ipv4Net) {
        self.add_prefix(u32::from(net.network()), u32::from(net.netmask()));
    }

    pub fn add_prefix(&mut self, prefix: u32, mask: u32) {
        self.nets.push((prefix & mask, mask));
    }

    pub fn is_local(&self, ip: u32) -> bool {
        self.nets.iter().any(|(prefix, mask)| ip & mask == *prefix)
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

}
