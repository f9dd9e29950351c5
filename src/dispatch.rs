use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use super::alert::AlertSink;
use super::capture::Capture;
use super::config::Config;
use super::decode;
use super::error::Result;
use super::flowkey::{self, Proto};
use super::flowtab::{self, TableInfo, Verdict};
use super::netset::NetSet;
use super::packet::{self, Packet};
use super::perf::IntervalSampler;
use super::rtmon::{self, InlineChain, PipeData, Pipeline};
use super::util;

// DISPATCHER
//
// The top-level per-packet path of one capture shard: reject outgoing,
// decode, localize, sample throughput, account in the flow tables, then
// hand to the real-time monitors (inline or pipelined) and free the
// buffer. A shard exclusively owns its tables, its sampler and (inline
// mode) its monitors; shards share nothing but the read-only config, the
// network set and the alert sink.
//
//   Shard - one capture context and everything it owns
//   new(id, cfg, nets, sink) -> Result<Shard>
//   process(packet, frame_len, outgoing) - the per-packet walk
//   run(capture, &stop) - capture loop until the stop flag rises
//   finish() - orderly teardown: stop monitors, report, drop tables

enum Chain {
    Off,
    Inline(InlineChain),
    Pipeline(Pipeline)
}

#[derive(Default)]
pub struct ShardStats {
    pub packets: u64,
    pub bytes: u64,
    pub outgoing: u64,
    pub decode_drops: u64,
    pub nonlocal_drops: u64,
    pub alerts: u64,
    pub overflow_drops: u64
}

pub struct Shard {
    pub id: usize,
    cfg: Arc<Config>,
    nets: Arc<NetSet>,
    sink: Arc<dyn AlertSink>,
    pub tables: TableInfo,
    perf: IntervalSampler,
    chain: Chain,
    pub stats: ShardStats
}

impl Shard {

    pub fn new(id: usize, cfg: Arc<Config>, nets: Arc<NetSet>,
               sink: Arc<dyn AlertSink>) -> Result<Shard> {
        let tables = TableInfo::with_hint(cfg.flow_entries);
        let chain = if cfg.rtmon {
            let monitors = rtmon::monitors(&cfg);
            if cfg.pipeline {
                Chain::Pipeline(rtmon::spawn(monitors, id, cfg.clean_interval)?)
            } else {
                Chain::Inline(InlineChain::new(monitors, cfg.clean_interval))
            }
        } else {
            Chain::Off
        };
        Ok(Shard {
            id,
            perf: IntervalSampler::new("throughput", id),
            cfg,
            nets,
            sink,
            tables,
            chain,
            stats: ShardStats::default()
        })
    }

    pub fn process(&mut self, mut p: Box<Packet>, frame_len: u32,
                   outgoing: bool) {
        // we don't care about packets this host sent
        if outgoing {
            self.stats.outgoing += 1;
            return packet::free(p);
        }
        self.stats.packets += 1;
        self.stats.bytes += frame_len as u64;

        let decoded = match decode::decode(&mut p) {
            Some(decoded) => decoded,
            None => {
                self.stats.decode_drops += 1;
                return packet::free(p);
            }
        };
        let mut key = decoded.key;

        let nets = &self.nets;
        let dir = match flowkey::localize(&mut key, |ip| nets.is_local(ip)) {
            Some(dir) => dir,
            None => {
                // neither endpoint is ours
                self.stats.nonlocal_drops += 1;
                return packet::free(p);
            }
        };

        if self.cfg.perfmon {
            self.perf.update(dir, frame_len);
        }

        if !self.cfg.flowmon {
            return packet::free(p);
        }
        let proto = match Proto::from_l4(key.l4_protocol) {
            Some(proto) => proto,
            None => return packet::free(p)
        };
        let data = match flowtab::flowmon_hook(&mut self.tables, &self.cfg,
                                               &*self.sink, &key, dir, proto,
                                               decoded.length) {
            Verdict::Pass(data) => data,
            Verdict::Alerted => {
                self.stats.alerts += 1;
                return packet::free(p);
            }
            Verdict::Overflow => {
                self.stats.overflow_drops += 1;
                return packet::free(p);
            }
        };

        match &mut self.chain {
            Chain::Inline(chain) => {
                chain.hook(&key, dir, &p, data);
                packet::free(p);
            }
            Chain::Pipeline(pipeline) => {
                pipeline.hook(PipeData { key, dir, packet: p, data });
            }
            Chain::Off => packet::free(p)
        }
    }

    pub fn run(&mut self, capture: Capture, stop: &AtomicBool) {
        info!("pna: shard {} capturing on {}", self.id, self.cfg.iface);
        util::pin_to_cpu(self.id);
        while !stop.load(Ordering::Relaxed) {
            if let Chain::Inline(chain) = &mut self.chain {
                chain.maybe_clean(Instant::now());
            }
            if !capture.wait_readable(100) {
                continue;
            }
            // drain the burst the kernel has buffered for us
            while let Some((p, frame_len, outgoing)) = capture.recv() {
                self.process(p, frame_len, outgoing);
            }
        }
    }

    pub fn finish(self) {
        match self.chain {
            Chain::Inline(chain) => chain.release(),
            Chain::Pipeline(pipeline) => {
                for monitor in pipeline.shutdown() {
                    monitor.release();
                }
            }
            Chain::Off => {}
        }
        let s = &self.stats;
        info!("pna: shard {}: {} packets, {} bytes, {} alerts",
              self.id,
              util::comma_value(s.packets),
              util::comma_value(s.bytes),
              util::comma_value(s.alerts));
        info!("pna: shard {} drops: outgoing {}, decode {}, non-local {}, \
               overflow {}",
              self.id, s.outgoing, s.decode_drops, s.nonlocal_drops,
              s.overflow_drops);
        let t = &self.tables;
        info!("pna: shard {} tables: lips {} ({} missed), rips {} ({} missed), \
               ports {} ({} missed)",
              self.id, t.nlips, t.nlips_missed, t.nrips, t.nrips_missed,
              t.nports, t.nports_missed);
    }

    #[cfg(test)]
    fn inline_monitors(&self) -> &[rtmon::Rtmon] {
        match &self.chain {
            Chain::Inline(chain) => chain.monitors(),
            _ => panic!("not an inline chain")
        }
    }

}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::alert::{AlertKind, TestSink};
    use crate::decode::testpkt;
    use crate::flowkey::Dir;
    use crate::headers;
    use crate::rtmon::Rtmon;

    const OUT: usize = 1;
    const IN: usize = 0;
    const TCP: usize = 0;

    fn shard(cfg: Config) -> (Shard, Arc<TestSink>) {
        let mut nets = NetSet::new();
        nets.add_prefix(0x0a000000, 0xff000000); // 10.0.0.0/8
        let sink = Arc::new(TestSink::new());
        let shard = Shard::new(0, Arc::new(cfg), Arc::new(nets),
                               sink.clone()).unwrap();
        (shard, sink)
    }

    fn small_cfg() -> Config {
        Config { flow_entries: 256, ..Config::default() }
    }

    #[test]
    fn outbound_packet_end_to_end() {
        let mut cfg = small_cfg();
        cfg.rtmon = true;
        let (mut shard, sink) = shard(cfg);
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "10.0.0.1", "8.8.8.8", 1000, 443, 100);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);

        assert_eq!(shard.stats.packets, 1);
        assert_eq!((shard.tables.nlips, shard.tables.nrips, shard.tables.nports),
                   (1, 1, 1));
        let lip = shard.tables.lip(0x0a000001).unwrap();
        assert_eq!(shard.tables.lips[lip].ndsts[OUT], 1);
        assert_eq!(shard.tables.lips[lip].nsess[OUT], 1);
        let rip = shard.tables.rip(lip, 0x08080808, Dir::Outbound).unwrap();
        assert_eq!(shard.tables.rips[rip].npkts[OUT][TCP], 1);
        assert_eq!(shard.tables.rips[rip].nbytes[OUT][TCP], 100);
        assert!(sink.take().is_empty());

        // the inline monitors saw it, session bit included
        match &shard.inline_monitors()[1] {
            Rtmon::Lipmon(m) => {
                let e = m.get(0x0a000001).unwrap();
                assert_eq!(e.npkts[OUT][TCP], 1);
                assert_eq!(e.nsess[OUT], 1);
            }
            _ => panic!("lipmon expected")
        }
        shard.finish();
    }

    #[test]
    fn reply_is_localized_to_the_same_flow() {
        let (mut shard, sink) = shard(small_cfg());
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "10.0.0.1", "8.8.8.8", 1000, 443, 100);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        // the reply arrives with the endpoints reversed
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "8.8.8.8", "10.0.0.1", 443, 1000, 60);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);

        assert_eq!((shard.tables.nlips, shard.tables.nrips, shard.tables.nports),
                   (1, 1, 1));
        let lip = shard.tables.lip(0x0a000001).unwrap();
        assert_eq!(shard.tables.lips[lip].ndsts[OUT], 1);
        assert_eq!(shard.tables.lips[lip].nsess[OUT], 1);
        assert_eq!(shard.tables.lips[lip].nsess[IN], 0); // no new session
        let rip = shard.tables.rip(lip, 0x08080808, Dir::Inbound).unwrap();
        assert_eq!(shard.tables.rips[rip].npkts[IN][TCP], 1);
        assert_eq!(shard.tables.rips[rip].nbytes[IN][TCP], 60);
        assert!(sink.take().is_empty());
        shard.finish();
    }

    #[test]
    fn outgoing_frames_are_rejected() {
        let (mut shard, _sink) = shard(small_cfg());
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "10.0.0.1", "8.8.8.8", 1000, 443, 100);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, true);
        assert_eq!(shard.stats.outgoing, 1);
        assert_eq!(shard.stats.packets, 0);
        assert_eq!(shard.tables.nlips, 0);
        shard.finish();
    }

    #[test]
    fn foreign_and_undecodable_packets_drop() {
        let (mut shard, _sink) = shard(small_cfg());
        // neither endpoint in 10/8
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "8.8.8.8", "1.1.1.1", 443, 1000, 60);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        assert_eq!(shard.stats.nonlocal_drops, 1);
        // ICMP decodes to nothing
        let p = testpkt::build(1, "10.0.0.1", "8.8.8.8", 0, 0, 84);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        assert_eq!(shard.stats.decode_drops, 1);
        assert_eq!(shard.tables.nlips, 0);
        shard.finish();
    }

    #[test]
    fn threshold_breach_alerts_and_stops() {
        let mut cfg = small_cfg();
        cfg.connections = 1;
        let (mut shard, sink) = shard(cfg);
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "10.0.0.1", "8.8.8.8", 1000, 443, 100);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        assert!(sink.take().is_empty());
        // second distinct destination trips the connections cap
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "10.0.0.1", "1.1.1.1", 1000, 443, 100);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        let alerts = sink.take();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertKind::Block);
        assert_eq!(alerts[0].1, 0x0a000001);
        assert_eq!(shard.stats.alerts, 1);
        // the blocked packet never reached level 2
        assert_eq!(shard.tables.nrips, 1);
        shard.finish();
    }

    #[test]
    fn udp_and_tcp_account_separately() {
        let (mut shard, _sink) = shard(small_cfg());
        let p = testpkt::build(headers::PROTOCOL_TCP,
                               "10.0.0.1", "8.8.8.8", 1000, 443, 100);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        let p = testpkt::build(headers::PROTOCOL_UDP,
                               "10.0.0.1", "8.8.8.8", 1000, 53, 80);
        let frame_len = p.length as u32;
        shard.process(p, frame_len, false);
        let lip = shard.tables.lip(0x0a000001).unwrap();
        let rip = shard.tables.rip(lip, 0x08080808, Dir::Outbound).unwrap();
        assert_eq!(shard.tables.rips[rip].npkts[OUT][TCP], 1);
        assert_eq!(shard.tables.rips[rip].npkts[OUT][1], 1); // udp column
        assert_eq!(shard.tables.rips[rip].nbytes[OUT][1], 80);
        assert_eq!(shard.tables.nports, 2);
        shard.finish();
    }
}
