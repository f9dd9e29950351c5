mod alert;
mod capture;
mod config;
mod conmon;
mod decode;
mod dispatch;
mod error;
mod fifo;
mod flowkey;
mod flowtab;
mod hashmap;
mod headers;
mod lipmon;
mod netset;
mod packet;
mod perf;
mod rtmon;
mod util;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use ipnet::Ipv4Net;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::alert::{AlertSink, LogSink};
use crate::capture::Capture;
use crate::config::Config;
use crate::dispatch::Shard;
use crate::error::{PnaError, Result};
use crate::netset::NetSet;

/// Passive network analyzer: watches an interface, accounts every flow
/// touching the monitored networks, and alerts on per-host thresholds.
#[derive(Parser, Debug)]
#[command(name = "pna", version)]
struct Args {
    /// Interface to monitor
    #[arg(short, long)]
    iface: String,

    /// File of monitored networks, one CIDR per line
    #[arg(short, long)]
    networks: Option<PathBuf>,

    /// Monitored network as a single CIDR (e.g. 10.0.0.0/8)
    #[arg(long)]
    net: Option<Ipv4Net>,

    /// Directory for alert logs
    #[arg(short = 'o', long, env = "PNA_LOGDIR", default_value = "./logs")]
    log_dir: PathBuf,

    /// Flow table capacity hint
    #[arg(short = 'f', long, default_value_t = 1 << 23)]
    flow_entries: u32,

    /// Capture shards, one per CPU
    #[arg(long, default_value_t = 1)]
    cpus: usize,

    /// Max distinct remote IPs per local IP before a block alert
    #[arg(long, default_value_t = u32::MAX)]
    connections: u32,

    /// Max distinct sessions per local IP before an alert
    #[arg(long, default_value_t = u32::MAX)]
    sessions: u32,

    /// Max outbound ports per (remote, protocol) before a block alert
    #[arg(long, default_value_t = u32::MAX)]
    ports: u32,

    /// Max outbound bytes per (remote, protocol) before a block alert
    #[arg(long, default_value_t = u64::MAX)]
    bytes: u64,

    /// Max outbound packets per (remote, protocol) before a block alert
    #[arg(long, default_value_t = u32::MAX)]
    packets: u32,

    /// Disable the flow tables
    #[arg(long)]
    no_flowmon: bool,

    /// Enable the real-time monitors
    #[arg(long)]
    rtmon: bool,

    /// Run the real-time monitors as pinned pipeline workers
    #[arg(long, requires = "rtmon")]
    pipeline: bool,

    /// Enable throughput sampling
    #[arg(long)]
    perfmon: bool,

    /// Seconds between monitor clean passes
    #[arg(long, default_value_t = 10)]
    clean_interval: u64,

    /// Log overflow diagnostics
    #[arg(long)]
    debug: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool
}

fn main() {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
    if let Err(e) = run(args) {
        error!("pna: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let (prefix, mask) = match args.net {
        Some(net) => (u32::from(net.network()), u32::from(net.netmask())),
        None => (0, 0)
    };
    let cfg = Arc::new(Config {
        iface: args.iface,
        cpus: args.cpus.max(1),
        prefix,
        mask,
        connections: args.connections,
        sessions: args.sessions,
        ports: args.ports,
        bytes: args.bytes,
        packets: args.packets,
        flowmon: !args.no_flowmon,
        rtmon: args.rtmon,
        pipeline: args.pipeline,
        perfmon: args.perfmon,
        flow_entries: args.flow_entries,
        clean_interval: Duration::from_secs(args.clean_interval.max(1)),
        debug: args.debug,
        log_dir: args.log_dir
    });

    let mut nets = match &args.networks {
        Some(path) => NetSet::build(path)?,
        None => NetSet::new()
    };
    if cfg.mask != 0 || cfg.prefix != 0 {
        nets.add_prefix(cfg.prefix, cfg.mask);
    }
    if nets.is_empty() {
        return Err(PnaError::NoNetworks);
    }
    let nets = Arc::new(nets);

    let sink: Arc<dyn AlertSink> = Arc::new(LogSink::new(&cfg.log_dir));

    let stop = Arc::new(AtomicBool::new(false));
    signal_flag::register(SIGINT, stop.clone()).map_err(PnaError::Signals)?;
    signal_flag::register(SIGTERM, stop.clone()).map_err(PnaError::Signals)?;

    // one capture socket and shard per CPU; with several, a fanout group
    // hashed on the flow splits the traffic between them
    let fanout = if cfg.cpus > 1 {
        Some((process::id() & 0xffff) as u16)
    } else {
        None
    };
    let mut shards = Vec::new();
    for id in 0..cfg.cpus {
        let started: Result<thread::JoinHandle<()>> = (|| {
            let capture = Capture::open(&cfg.iface, fanout)?;
            let mut shard = Shard::new(id, cfg.clone(), nets.clone(),
                                       sink.clone())?;
            let stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("pna_flowmon/{}", id))
                .spawn(move || {
                    shard.run(capture, &stop);
                    shard.finish();
                })
                .map_err(PnaError::Spawn)?;
            Ok(handle)
        })();
        match started {
            Ok(handle) => shards.push(handle),
            Err(e) => {
                // unwind the shards already capturing before bailing out
                stop.store(true, Ordering::Relaxed);
                for shard in shards {
                    let _ = shard.join();
                }
                return Err(e);
            }
        }
    }

    info!("pna: initialized, {} network(s), {} shard(s){}",
          nets.len(), cfg.cpus,
          if cfg.pipeline { ", pipeline mode" } else { "" });

    for shard in shards {
        let _ = shard.join();
    }
    info!("pna: inactive");
    Ok(())
}
