use tracing::{debug, info};

use super::flowkey::{Dir, FlowKey, DIRECTIONS};
use super::flowtab::NEW_SESSION;
use super::hashmap::{HashMap, MapKey};
use super::packet::Packet;

// CONNECTION MONITOR
//
// First rtmon stage: real-time per-connection accounting, where a
// connection is a (local IP, remote IP) pair. State lives in a two-choice
// hash map sized at init; clean() logs a summary of the interval and
// resets the map, so the view is always "connections active since the
// last clean".
//
//   Conmon - the monitor
//   new(n_pairs) -> Conmon
//   hook(&FlowKey, Dir, &Packet, &mut u64) - account one packet
//   clean() - summarize and reset interval state
//   release() - final summary at shutdown

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConKey {
    pub local_ip: u32,
    pub remote_ip: u32
}

impl MapKey for ConKey {}

#[derive(Clone, Copy, Default)]
pub struct ConEntry {
    pub npkts: [u32; DIRECTIONS],
    pub nbytes: [u64; DIRECTIONS],
    pub nsess: u32
}

pub struct Conmon {
    map: HashMap<ConKey, ConEntry>,
    misses: u64,
    total_pkts: u64
}

impl Conmon {

    pub fn new(n_pairs: u32) -> Conmon {
        Conmon {
            map: HashMap::new(n_pairs),
            misses: 0,
            total_pkts: 0
        }
    }

    pub fn hook(&mut self, key: &FlowKey, dir: Dir, packet: &Packet,
                data: &mut u64) {
        self.total_pkts += 1;
        let con = ConKey {
            local_ip: key.local_ip,
            remote_ip: key.remote_ip
        };
        match self.map.get_or_put(con) {
            Some(entry) => {
                entry.npkts[dir.index()] += 1;
                entry.nbytes[dir.index()] += packet.length as u64;
                if *data & NEW_SESSION != 0 {
                    entry.nsess += 1;
                }
            }
            None => self.misses += 1
        }
    }

    pub fn clean(&mut self) {
        if !self.map.is_empty() || self.misses > 0 {
            debug!("conmon: {} connections this interval ({} misses)",
                   self.map.len(), self.misses);
        }
        self.map.reset();
        self.misses = 0;
    }

    pub fn release(&self) {
        info!("conmon: {} packets accounted", self.total_pkts);
    }

    pub fn connections(&self) -> u32 {
        self.map.len()
    }

    pub fn packets_accounted(&self) -> u64 {
        self.total_pkts
    }

    pub fn get(&self, key: &ConKey) -> Option<&ConEntry> {
        self.map.get(key)
    }

}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::packet;

    fn key(lip: u32, rip: u32) -> FlowKey {
        FlowKey {
            l3_protocol: 0x0800,
            l4_protocol: 6,
            local_ip: lip,
            remote_ip: rip,
            local_port: 1000,
            remote_port: 443
        }
    }

    #[test]
    fn accounts_per_connection() {
        let mut mon = Conmon::new(64);
        let mut p = packet::allocate();
        p.length = 100;

        let mut data = NEW_SESSION;
        mon.hook(&key(0x0a000001, 0x08080808), Dir::Outbound, &p, &mut data);
        let mut data = 0;
        mon.hook(&key(0x0a000001, 0x08080808), Dir::Inbound, &p, &mut data);
        let mut data = NEW_SESSION;
        mon.hook(&key(0x0a000001, 0x01010101), Dir::Outbound, &p, &mut data);

        assert_eq!(mon.connections(), 2);
        let e = mon.get(&ConKey { local_ip: 0x0a000001, remote_ip: 0x08080808 })
            .unwrap();
        assert_eq!(e.npkts, [1, 1]);
        assert_eq!(e.nbytes, [100, 100]);
        assert_eq!(e.nsess, 1);
        packet::free(p);
    }

    #[test]
    fn clean_resets_interval_state() {
        let mut mon = Conmon::new(64);
        let p = packet::allocate();
        let mut data = 0;
        mon.hook(&key(0x0a000001, 0x08080808), Dir::Outbound, &p, &mut data);
        assert_eq!(mon.connections(), 1);
        mon.clean();
        assert_eq!(mon.connections(), 0);
        // totals survive the clean
        assert_eq!(mon.total_pkts, 1);
        packet::free(p);
    }

    #[test]
    fn overload_counts_misses() {
        let mut mon = Conmon::new(8);
        let p = packet::allocate();
        for i in 0..64u32 {
            let mut data = 0;
            mon.hook(&key(0x0a000001 + i, 0x08080808), Dir::Outbound, &p,
                     &mut data);
        }
        assert!(mon.connections() <= 8);
        assert_eq!(mon.misses + mon.connections() as u64, 64);
        packet::free(p);
    }
}
