use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use super::config::Config;
use super::conmon::Conmon;
use super::error::{PnaError, Result};
use super::fifo;
use super::flowkey::{Dir, FlowKey};
use super::lipmon::Lipmon;
use super::packet::{self, Packet};
use super::perf::IntervalSampler;
use super::util;

// REAL-TIME MONITOR PIPELINE
//
// The registry of real-time monitors and the two ways to run them. Each
// monitor exposes the same capability set (hook, clean, release, name);
// they are concrete types behind an enum, iterated in registration order.
//
//   Rtmon - tagged union of the concrete monitors (conmon, lipmon)
//   monitors(&Config) -> Vec<Rtmon> - the registry, in order
//   PipeData - what flows between pipeline stages
//   InlineChain - run every monitor sequentially on the capture thread
//   Pipeline - one pinned worker per monitor, chained through SPSC FIFOs
//
// In pipeline mode the dispatcher enqueues into the first stage; each
// worker dequeues, hooks, and forwards to the next stage, and the last
// stage frees the packet. A full FIFO drops the packet at that stage with
// a log line. Workers exit when their upstream producer is gone and their
// FIFO has drained, so teardown cascades stage by stage; monitors are
// released by the caller after the join.
//
// clean() runs every clean_interval on whichever thread owns the monitor
// (the worker, or the dispatcher via maybe_clean in inline mode), so
// monitor state never crosses threads.

pub const PNA_RTMON_FIFO_SZ: usize = 32768;

pub struct PipeData {
    pub key: FlowKey,
    pub dir: Dir,
    pub packet: Box<Packet>,
    pub data: u64
}

pub enum Rtmon {
    Conmon(Conmon),
    Lipmon(Lipmon)
}

impl Rtmon {

    pub fn name(&self) -> &'static str {
        match self {
            Rtmon::Conmon(_) => "conmon",
            Rtmon::Lipmon(_) => "lipmon"
        }
    }

    pub fn hook(&mut self, key: &FlowKey, dir: Dir, packet: &Packet,
                data: &mut u64) {
        match self {
            Rtmon::Conmon(m) => m.hook(key, dir, packet, data),
            Rtmon::Lipmon(m) => m.hook(key, dir, packet, data)
        }
    }

    pub fn clean(&mut self) {
        match self {
            Rtmon::Conmon(m) => m.clean(),
            Rtmon::Lipmon(m) => m.clean()
        }
    }

    pub fn release(&self) {
        match self {
            Rtmon::Conmon(m) => m.release(),
            Rtmon::Lipmon(m) => m.release()
        }
    }

}

// The monitor registry, in registration (and pipeline stage) order.
pub fn monitors(cfg: &Config) -> Vec<Rtmon> {
    vec![
        Rtmon::Conmon(Conmon::new(cfg.flow_entries.clamp(1024, 1 << 16))),
        Rtmon::Lipmon(Lipmon::new(cfg.flow_entries.clamp(1024, 1 << 12)))
    ]
}


// Inline mode

pub struct InlineChain {
    monitors: Vec<Rtmon>,
    clean_interval: Duration,
    clean_deadline: Instant
}

impl InlineChain {

    pub fn new(monitors: Vec<Rtmon>, clean_interval: Duration) -> InlineChain {
        InlineChain {
            monitors,
            clean_interval,
            clean_deadline: Instant::now() + clean_interval
        }
    }

    pub fn hook(&mut self, key: &FlowKey, dir: Dir, packet: &Packet,
                mut data: u64) {
        for monitor in self.monitors.iter_mut() {
            monitor.hook(key, dir, packet, &mut data);
        }
    }

    // called by the dispatcher once per loop turn
    pub fn maybe_clean(&mut self, now: Instant) {
        if now >= self.clean_deadline {
            for monitor in self.monitors.iter_mut() {
                monitor.clean();
            }
            self.clean_deadline = now + self.clean_interval;
        }
    }

    pub fn release(&self) {
        for monitor in self.monitors.iter() {
            monitor.release();
        }
    }

    pub fn monitors(&self) -> &[Rtmon] {
        &self.monitors
    }

}


// Pipeline mode

pub struct Pipeline {
    first: fifo::Producer<PipeData>,
    threads: Vec<thread::JoinHandle<Rtmon>>,
    pub overflows: u64
}

pub fn spawn(monitors: Vec<Rtmon>, shard: usize, clean_interval: Duration)
             -> Result<Pipeline> {
    assert!(!monitors.is_empty());
    let nmons = monitors.len();
    let mut producers = Vec::new();
    let mut consumers = Vec::new();
    for _ in 0..nmons {
        let (tx, rx) = fifo::channel(PNA_RTMON_FIFO_SZ);
        producers.push(tx);
        consumers.push(rx);
    }
    let first = producers.remove(0);
    // producers[i] now feeds stage i+1

    let mut threads: Vec<thread::JoinHandle<Rtmon>> = Vec::new();
    for (stage, monitor) in monitors.into_iter().enumerate() {
        let rx = consumers.remove(0);
        let next = if stage + 1 < nmons { Some(producers.remove(0)) } else { None };
        let cpu = shard + stage + 1;
        let spawned = thread::Builder::new()
            .name(format!("pna_{}/{}", monitor.name(), shard))
            .spawn(move || worker(monitor, rx, next, shard, cpu, clean_interval));
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                // unwind the stages already running: dropping their
                // producers cascades the shutdown
                drop(first);
                drop(producers);
                drop(consumers);
                for t in threads {
                    let _ = t.join();
                }
                return Err(PnaError::Spawn(e));
            }
        }
    }
    Ok(Pipeline { first, threads, overflows: 0 })
}

impl Pipeline {

    pub fn hook(&mut self, piped: PipeData) {
        if let Err(back) = self.first.push(piped) {
            self.overflows += 1;
            info!("fifo overflow (start)");
            packet::free(back.packet);
        }
    }

    // Stop the workers (by disconnecting the first stage), drain, join,
    // and hand the monitors back for release.
    pub fn shutdown(self) -> Vec<Rtmon> {
        drop(self.first);
        self.threads.into_iter()
            .map(|t| t.join().expect("rtmon worker panicked"))
            .collect()
    }

}

fn worker(mut monitor: Rtmon, rx: fifo::Consumer<PipeData>,
          next: Option<fifo::Producer<PipeData>>, shard: usize, cpu: usize,
          clean_interval: Duration) -> Rtmon {
    util::pin_to_cpu(cpu);
    let mut perf = IntervalSampler::new(monitor.name(), shard);
    let mut clean_deadline = Instant::now() + clean_interval;
    loop {
        let now = Instant::now();
        if now >= clean_deadline {
            monitor.clean();
            clean_deadline = now + clean_interval;
        }
        match rx.pop() {
            Some(mut piped) => {
                monitor.hook(&piped.key, piped.dir, &piped.packet,
                             &mut piped.data);
                perf.update(piped.dir, piped.packet.length as u32);
                match &next {
                    Some(tx) => {
                        if let Err(back) = tx.push(piped) {
                            info!("fifo overflow ({})", monitor.name());
                            packet::free(back.packet);
                        }
                    }
                    None => packet::free(piped.packet)
                }
            }
            None => {
                if rx.disconnected() {
                    break;
                }
                thread::yield_now();
            }
        }
    }
    monitor
}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::flowkey::FlowKey;
    use crate::headers;

    fn key(lip: u32, rip: u32, lport: u16) -> FlowKey {
        FlowKey {
            l3_protocol: headers::TYPE_IPV4,
            l4_protocol: headers::PROTOCOL_TCP,
            local_ip: lip,
            remote_ip: rip,
            local_port: lport,
            remote_port: 443
        }
    }

    fn registry() -> Vec<Rtmon> {
        monitors(&Config::default())
    }

    #[test]
    fn registry_order() {
        let mons = registry();
        let names: Vec<&str> = mons.iter().map(|m| m.name()).collect();
        assert_eq!(names, ["conmon", "lipmon"]);
    }

    #[test]
    fn inline_chain_runs_all_monitors() {
        let mut chain = InlineChain::new(registry(), Duration::from_secs(60));
        let mut p = packet::allocate();
        p.length = 100;
        chain.hook(&key(0x0a000001, 0x08080808, 1000), Dir::Outbound, &p,
                   crate::flowtab::NEW_SESSION);
        chain.hook(&key(0x0a000001, 0x01010101, 1001), Dir::Outbound, &p, 0);
        packet::free(p);
        match &chain.monitors()[0] {
            Rtmon::Conmon(m) => assert_eq!(m.connections(), 2),
            _ => panic!("conmon expected first")
        }
        match &chain.monitors()[1] {
            Rtmon::Lipmon(m) => {
                assert_eq!(m.hosts(), 1);
                let e = m.get(0x0a000001).unwrap();
                assert_eq!(e.nsess[Dir::Outbound.index()], 1);
            }
            _ => panic!("lipmon expected second")
        }
        chain.release();
    }

    #[test]
    fn inline_clean_fires_on_deadline() {
        let mut chain = InlineChain::new(registry(), Duration::from_secs(60));
        let p = packet::allocate();
        chain.hook(&key(0x0a000001, 0x08080808, 1000), Dir::Outbound, &p, 0);
        packet::free(p);
        // not due yet
        chain.maybe_clean(Instant::now());
        match &chain.monitors()[0] {
            Rtmon::Conmon(m) => assert_eq!(m.connections(), 1),
            _ => unreachable!()
        }
        // force the deadline
        chain.maybe_clean(Instant::now() + Duration::from_secs(61));
        match &chain.monitors()[0] {
            Rtmon::Conmon(m) => assert_eq!(m.connections(), 0),
            _ => unreachable!()
        }
    }

    #[test]
    fn pipeline_processes_and_drains() {
        let mut pipeline = spawn(registry(), 0, Duration::from_secs(60))
            .unwrap();
        let n = 1000u32;
        for i in 0..n {
            let mut p = packet::allocate();
            p.length = 60;
            pipeline.hook(PipeData {
                key: key(0x0a000001 + (i % 7), 0x08080808, 1000 + (i % 13) as u16),
                dir: Dir::Outbound,
                packet: p,
                data: 0
            });
        }
        assert_eq!(pipeline.overflows, 0);
        let mons = pipeline.shutdown();
        assert_eq!(mons.len(), 2);
        match &mons[0] {
            Rtmon::Conmon(m) => {
                assert_eq!(m.packets_accounted(), n as u64);
                assert_eq!(m.connections(), 7);
            }
            _ => panic!("conmon expected first")
        }
        match &mons[1] {
            Rtmon::Lipmon(m) => {
                assert_eq!(m.packets_accounted(), n as u64);
                assert_eq!(m.hosts(), 7);
            }
            _ => panic!("lipmon expected second")
        }
        for m in &mons {
            m.release();
        }
    }
}
