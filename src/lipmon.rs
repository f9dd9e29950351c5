use tracing::{debug, info};

use super::flowkey::{Dir, FlowKey, Proto, DIRECTIONS, PROTOS};
use super::flowtab::NEW_SESSION;
use super::hashmap::HashMap;
use super::packet::Packet;

// LOCAL IP MONITOR
//
// Second rtmon stage: real-time per-local-host accounting split by
// transport protocol. Same interval discipline as conmon: clean()
// summarizes and resets, release() reports totals.
//
//   Lipmon - the monitor
//   new(n_pairs) -> Lipmon
//   hook(&FlowKey, Dir, &Packet, &mut u64) - account one packet
//   clean() / release()

#[derive(Clone, Copy, Default)]
pub struct LipmonEntry {
    pub npkts: [[u32; PROTOS]; DIRECTIONS],
    pub nbytes: [[u64; PROTOS]; DIRECTIONS],
    pub nsess: [u32; DIRECTIONS]
}

pub struct Lipmon {
    map: HashMap<u32, LipmonEntry>,
    misses: u64,
    total_pkts: u64
}

impl Lipmon {

    pub fn new(n_pairs: u32) -> Lipmon {
        Lipmon {
            map: HashMap::new(n_pairs),
            misses: 0,
            total_pkts: 0
        }
    }

    pub fn hook(&mut self, key: &FlowKey, dir: Dir, packet: &Packet,
                data: &mut u64) {
        let proto = match Proto::from_l4(key.l4_protocol) {
            Some(proto) => proto,
            None => return
        };
        self.total_pkts += 1;
        match self.map.get_or_put(key.local_ip) {
            Some(entry) => {
                entry.npkts[dir.index()][proto.index()] += 1;
                entry.nbytes[dir.index()][proto.index()] += packet.length as u64;
                if *data & NEW_SESSION != 0 {
                    entry.nsess[dir.index()] += 1;
                }
            }
            None => self.misses += 1
        }
    }

    pub fn clean(&mut self) {
        if !self.map.is_empty() || self.misses > 0 {
            debug!("lipmon: {} local hosts this interval ({} misses)",
                   self.map.len(), self.misses);
        }
        self.map.reset();
        self.misses = 0;
    }

    pub fn release(&self) {
        info!("lipmon: {} packets accounted", self.total_pkts);
    }

    pub fn hosts(&self) -> u32 {
        self.map.len()
    }

    pub fn packets_accounted(&self) -> u64 {
        self.total_pkts
    }

    pub fn get(&self, local_ip: u32) -> Option<&LipmonEntry> {
        self.map.get(&local_ip)
    }

}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::headers;
    use crate::packet;

    fn key(lip: u32, l4: u8) -> FlowKey {
        FlowKey {
            l3_protocol: 0x0800,
            l4_protocol: l4,
            local_ip: lip,
            remote_ip: 0x08080808,
            local_port: 1000,
            remote_port: 443
        }
    }

    #[test]
    fn splits_by_protocol_and_direction() {
        let mut mon = Lipmon::new(64);
        let mut p = packet::allocate();
        p.length = 100;

        let mut data = NEW_SESSION;
        mon.hook(&key(0x0a000001, headers::PROTOCOL_TCP), Dir::Outbound, &p,
                 &mut data);
        let mut data = NEW_SESSION;
        mon.hook(&key(0x0a000001, headers::PROTOCOL_UDP), Dir::Inbound, &p,
                 &mut data);

        assert_eq!(mon.hosts(), 1);
        let e = mon.get(0x0a000001).unwrap();
        assert_eq!(e.npkts[Dir::Outbound.index()][Proto::Tcp.index()], 1);
        assert_eq!(e.npkts[Dir::Inbound.index()][Proto::Udp.index()], 1);
        assert_eq!(e.npkts[Dir::Inbound.index()][Proto::Tcp.index()], 0);
        assert_eq!(e.nsess, [1, 1]);
        packet::free(p);
    }

    #[test]
    fn ignores_unknown_transport() {
        let mut mon = Lipmon::new(64);
        let p = packet::allocate();
        let mut data = 0;
        mon.hook(&key(0x0a000001, 1 /* ICMP */), Dir::Outbound, &p, &mut data);
        assert_eq!(mon.hosts(), 0);
        assert_eq!(mon.total_pkts, 0);
        packet::free(p);
    }

    #[test]
    fn clean_resets() {
        let mut mon = Lipmon::new(64);
        let p = packet::allocate();
        let mut data = 0;
        mon.hook(&key(0x0a000001, headers::PROTOCOL_TCP), Dir::Outbound, &p,
                 &mut data);
        mon.clean();
        assert_eq!(mon.hosts(), 0);
        packet::free(p);
    }
}
