use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::alert::{AlertKind, AlertSink};
use super::config::Config;
use super::flowkey::{Dir, FlowKey, Proto, DIRECTIONS, PROTOS};

// THREE-LEVEL FLOW TABLE
//
// The per-shard hierarchical flow accounting engine: local IP -> remote IP
// -> (protocol, port pair). Each level is a fixed open-address table probed
// linearly up to PROBE_LIMIT slots. The RIP and Port tables are shared by
// every parent entry that hashes into them; a parent owns the slots marked
// in its ownership bitmap, so a slot match requires both the key and the
// owner's bit. Every operation is bounded and lock-free; a TableInfo is
// exclusively owned by its shard.
//
//   TableInfo - the three tables plus entry/miss counters for one shard
//   TableInfo::new(lip_bits, rip_bits, port_bits) / with_hint(flow_entries)
//   lip(local_ip) -> Option<usize> - find or claim a level-1 entry
//   rip(lip, remote_ip, dir) -> Option<usize> - find or claim level 2
//   port(lip, rip, proto, lport, rport, length, dir) -> Option<(usize, bool)>
//       - find or claim level 3, accounting bytes/packets; bool is
//         "created", i.e. a new session was born
//   reset() - zero all levels (the flush collaborator's half)
//   flowmon_hook(...) -> Verdict - full per-packet walk with threshold
//       checks and alerts
//
// Overflow at any level increments the level's *_missed counter and drops
// the packet; it is a diagnostic, never an error.

pub const PROBE_LIMIT: usize = 128;

const BITMAP_BITS: usize = 32;

// Golden-ratio multiplicative hash over the high bits, 32-bit flavor.
const GOLDEN_RATIO_32: u32 = 0x61c88647;

pub fn hash_long(val: u32, bits: u32) -> usize {
    (val.wrapping_mul(GOLDEN_RATIO_32) >> (32 - bits)) as usize
}

// info_bits layout: direction-seen in the low DIRECTIONS bits, then
// first-seen-direction. The first-seen bits are write-only here; they are
// kept for external analysis of dumped tables.
fn dir_seen(dir: Dir) -> u8 { 1 << dir.index() }
fn dir_first(dir: Dir) -> u8 { 1 << (dir.index() + DIRECTIONS) }

pub struct LipEntry {
    pub local_ip: u32, // 0 = free slot
    pub ndsts: [u32; DIRECTIONS],
    pub nsess: [u32; DIRECTIONS],
    dsts: Box<[u32]> // ownership bitmap over the RIP hash space
}

impl LipEntry {
    fn new(rip_words: usize) -> LipEntry {
        LipEntry {
            local_ip: 0,
            ndsts: [0; DIRECTIONS],
            nsess: [0; DIRECTIONS],
            dsts: vec![0; rip_words].into_boxed_slice()
        }
    }

    fn clear(&mut self) {
        self.local_ip = 0;
        self.ndsts = [0; DIRECTIONS];
        self.nsess = [0; DIRECTIONS];
        self.dsts.iter_mut().for_each(|w| *w = 0);
    }

    pub fn owns_rip(&self, slot: usize) -> bool {
        self.dsts[slot / BITMAP_BITS] & (1 << (slot % BITMAP_BITS)) != 0
    }
}

pub struct RipEntry {
    pub remote_ip: u32, // 0 = free slot
    pub info_bits: u8,
    pub nprts: [[u32; PROTOS]; DIRECTIONS],
    pub npkts: [[u32; PROTOS]; DIRECTIONS],
    pub nbytes: [[u64; PROTOS]; DIRECTIONS],
    prts: [Box<[u32]>; PROTOS] // per-protocol bitmaps over the port hash space
}

impl RipEntry {
    fn new(port_words: usize) -> RipEntry {
        RipEntry {
            remote_ip: 0,
            info_bits: 0,
            nprts: [[0; PROTOS]; DIRECTIONS],
            npkts: [[0; PROTOS]; DIRECTIONS],
            nbytes: [[0; PROTOS]; DIRECTIONS],
            prts: [vec![0; port_words].into_boxed_slice(),
                   vec![0; port_words].into_boxed_slice()]
        }
    }

    fn clear(&mut self) {
        self.remote_ip = 0;
        self.info_bits = 0;
        self.nprts = [[0; PROTOS]; DIRECTIONS];
        self.npkts = [[0; PROTOS]; DIRECTIONS];
        self.nbytes = [[0; PROTOS]; DIRECTIONS];
        for prts in self.prts.iter_mut() {
            prts.iter_mut().for_each(|w| *w = 0);
        }
    }

    pub fn owns_port(&self, proto: Proto, slot: usize) -> bool {
        self.prts[proto.index()][slot / BITMAP_BITS]
            & (1 << (slot % BITMAP_BITS)) != 0
    }
}

#[derive(Clone, Default)]
pub struct PortEntry {
    pub local_port: u16, // both ports 0 = free slot
    pub remote_port: u16,
    pub info_bits: u8,
    pub npkts: [u32; DIRECTIONS],
    pub nbytes: [u64; DIRECTIONS],
    pub timestamp: u64 // first-seen wall time, seconds
}

pub struct TableInfo {
    lip_bits: u32,
    rip_bits: u32,
    port_bits: u32,
    pub lips: Box<[LipEntry]>,
    pub rips: Box<[RipEntry]>,
    pub ports: [Box<[PortEntry]>; PROTOS],
    pub nlips: u32,
    pub nrips: u32,
    pub nports: u32,
    pub nlips_missed: u32,
    pub nrips_missed: u32,
    pub nports_missed: u32
}

impl TableInfo {

    pub fn new(lip_bits: u32, rip_bits: u32, port_bits: u32) -> TableInfo {
        assert!(lip_bits >= 1 && rip_bits >= 1 && port_bits >= 1);
        assert!(lip_bits <= 24 && rip_bits <= 24 && port_bits <= 24);
        let nlip = 1usize << lip_bits;
        let nrip = 1usize << rip_bits;
        let nport = 1usize << port_bits;
        let rip_words = (nrip + BITMAP_BITS - 1) / BITMAP_BITS;
        let port_words = (nport + BITMAP_BITS - 1) / BITMAP_BITS;
        TableInfo {
            lip_bits,
            rip_bits,
            port_bits,
            lips: (0..nlip).map(|_| LipEntry::new(rip_words))
                .collect::<Vec<_>>().into_boxed_slice(),
            rips: (0..nrip).map(|_| RipEntry::new(port_words))
                .collect::<Vec<_>>().into_boxed_slice(),
            ports: [vec![PortEntry::default(); nport].into_boxed_slice(),
                    vec![PortEntry::default(); nport].into_boxed_slice()],
            nlips: 0,
            nrips: 0,
            nports: 0,
            nlips_missed: 0,
            nrips_missed: 0,
            nports_missed: 0
        }
    }

    // flow_entries is a capacity hint: it sizes the port level, with the
    // upper levels scaled down from it.
    pub fn with_hint(flow_entries: u32) -> TableInfo {
        let bits = flow_entries.max(1).next_power_of_two().trailing_zeros();
        let port_bits = bits.clamp(8, 14);
        TableInfo::new(port_bits - 4, port_bits - 2, port_bits)
    }

    /// Level 1: find or claim the entry for a local IP.
    pub fn lip(&mut self, local_ip: u32) -> Option<usize> {
        let mut hash = hash_long(local_ip, self.lip_bits);
        let n = self.lips.len();
        for _ in 0..PROBE_LIMIT {
            let entry = &mut self.lips[hash];
            if entry.local_ip == local_ip {
                return Some(hash);
            }
            if entry.local_ip == 0 {
                entry.local_ip = local_ip;
                self.nlips += 1;
                return Some(hash);
            }
            hash = (hash + 1) % n;
        }
        self.nlips_missed += 1;
        None
    }

    /// Level 2: find or claim the entry for (local, remote), tracking the
    /// owner's distinct-destination count per direction.
    pub fn rip(&mut self, lip: usize, remote_ip: u32, dir: Dir) -> Option<usize> {
        let Self { lips, rips, rip_bits, nrips, nrips_missed, .. } = self;
        let owner = &mut lips[lip];
        let mut hash = hash_long(owner.local_ip ^ remote_ip, *rip_bits);
        let n = rips.len();
        for _ in 0..PROBE_LIMIT {
            let entry = &mut rips[hash];
            // a match needs the key and the owner's bit: the slot may hold
            // the same remote on behalf of a different local IP
            if entry.remote_ip == remote_ip && owner.owns_rip(hash) {
                if entry.info_bits & dir_seen(dir) == 0 {
                    owner.ndsts[dir.index()] += 1;
                    entry.info_bits |= dir_seen(dir);
                }
                return Some(hash);
            }
            if entry.remote_ip == 0 {
                owner.dsts[hash / BITMAP_BITS] |= 1 << (hash % BITMAP_BITS);
                entry.remote_ip = remote_ip;
                owner.ndsts[dir.index()] += 1;
                entry.info_bits |= dir_seen(dir);
                entry.info_bits |= dir_first(dir);
                *nrips += 1;
                return Some(hash);
            }
            hash = (hash + 1) % n;
        }
        *nrips_missed += 1;
        None
    }

    /// Level 3: find or claim the session entry, accounting bytes and
    /// packets on both the RIP and Port levels. Returns (slot, created).
    pub fn port(&mut self, lip: usize, rip: usize, proto: Proto,
                local_port: u16, remote_port: u16, length: u16, dir: Dir)
                -> Option<(usize, bool)> {
        let Self { lips, rips, ports, port_bits, nports, nports_missed, .. } = self;
        let owner = &mut rips[rip];
        let table = &mut ports[proto.index()];
        let d = dir.index();
        let p = proto.index();
        let key = owner.remote_ip
            ^ (((remote_port as u32) << 16) | local_port as u32);
        let mut hash = hash_long(key, *port_bits);
        let n = table.len();
        for _ in 0..PROBE_LIMIT {
            let entry = &mut table[hash];
            if entry.local_port == local_port && entry.remote_port == remote_port
                && owner.owns_port(proto, hash)
            {
                owner.nbytes[d][p] += length as u64;
                owner.npkts[d][p] += 1;
                entry.nbytes[d] += length as u64;
                entry.npkts[d] += 1;
                if entry.info_bits & dir_seen(dir) == 0 {
                    owner.nprts[d][p] += 1;
                    entry.info_bits |= dir_seen(dir);
                }
                return Some((hash, false));
            }
            if entry.local_port == 0 && entry.remote_port == 0 {
                entry.local_port = local_port;
                entry.remote_port = remote_port;
                owner.prts[p][hash / BITMAP_BITS] |= 1 << (hash % BITMAP_BITS);
                owner.nbytes[d][p] += length as u64;
                owner.npkts[d][p] += 1;
                entry.nbytes[d] += length as u64;
                entry.npkts[d] += 1;
                entry.timestamp = wall_seconds();
                owner.nprts[d][p] += 1;
                entry.info_bits |= dir_seen(dir);
                entry.info_bits |= dir_first(dir);
                // a new session is born, the local IP holds the tally
                lips[lip].nsess[d] += 1;
                *nports += 1;
                return Some((hash, true));
            }
            hash = (hash + 1) % n;
        }
        *nports_missed += 1;
        None
    }

    pub fn reset(&mut self) {
        self.lips.iter_mut().for_each(LipEntry::clear);
        self.rips.iter_mut().for_each(RipEntry::clear);
        for table in self.ports.iter_mut() {
            table.iter_mut().for_each(|e| *e = PortEntry::default());
        }
        self.nlips = 0;
        self.nrips = 0;
        self.nports = 0;
        self.nlips_missed = 0;
        self.nrips_missed = 0;
        self.nports_missed = 0;
    }

}

fn wall_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Pipe data bit handed to the rtmon stages when the packet opened a new
// session.
pub const NEW_SESSION: u64 = 1;

pub enum Verdict {
    Pass(u64), // carry the pipe data word to the rtmon stages
    Alerted,   // a threshold fired; processing of this packet stops
    Overflow   // a level was full; packet dropped silently
}

/// The flowmon walk for one canonicalized packet: three table levels with
/// the threshold checks interleaved exactly where the accounting leaves the
/// counters. The first breach alerts and ends processing.
pub fn flowmon_hook(info: &mut TableInfo, cfg: &Config, sink: &dyn AlertSink,
                    key: &FlowKey, dir: Dir, proto: Proto, length: u16)
                    -> Verdict {
    let out = Dir::Outbound.index();
    let p = proto.index();

    let lip = match info.lip(key.local_ip) {
        Some(lip) => lip,
        None => {
            if cfg.debug { debug!("detected full source table"); }
            return Verdict::Overflow;
        }
    };
    if info.lips[lip].ndsts[out] >= cfg.connections {
        // host is talking to too many destinations
        sink.session_action(AlertKind::Block, key.local_ip, "too many connections");
        return Verdict::Alerted;
    }

    let rip = match info.rip(lip, key.remote_ip, dir) {
        Some(rip) => rip,
        None => {
            if cfg.debug { debug!("detected full destination table"); }
            return Verdict::Overflow;
        }
    };
    let entry = &info.rips[rip];
    if entry.nprts[out][p] >= cfg.ports {
        sink.session_action(AlertKind::Block, key.local_ip, "too many ports");
        return Verdict::Alerted;
    }
    if entry.nbytes[out][p] >= cfg.bytes {
        sink.session_action(AlertKind::Block, key.local_ip, "too many bytes");
        return Verdict::Alerted;
    }
    if entry.npkts[out][p] >= cfg.packets {
        sink.session_action(AlertKind::Block, key.local_ip, "too many packets");
        return Verdict::Alerted;
    }

    let created = match info.port(lip, rip, proto, key.local_port,
                                  key.remote_port, length, dir) {
        Some((_, created)) => created,
        None => {
            if cfg.debug { debug!("detected full port table"); }
            return Verdict::Overflow;
        }
    };
    if info.lips[lip].nsess[out] >= cfg.sessions {
        sink.session_action(AlertKind::Block, key.local_ip, "too many sessions");
        return Verdict::Alerted;
    }
    if info.lips[lip].nsess[Dir::Inbound.index()] >= cfg.sessions {
        // someone outside is opening sessions toward this host
        sink.session_action(AlertKind::Whitelist, key.local_ip, "external scan");
        return Verdict::Alerted;
    }

    Verdict::Pass(if created { NEW_SESSION } else { 0 })
}
