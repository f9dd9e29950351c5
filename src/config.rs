use std::path::PathBuf;
use std::time::Duration;

// CONFIGURATION
//
// Process-wide analyzer settings, built once at startup from the command
// line and read-only afterwards. The hot path sees this through a shared
// reference; there is no runtime reconfiguration.
//
//   Config - the settings struct (one field per pna_* parameter)

#[derive(Clone, Debug)]
pub struct Config {
    // capture
    pub iface: String,
    pub cpus: usize,

    // monitored network in host order; the full set of networks lives in
    // the NetSet, this pair is the single-prefix shorthand
    pub prefix: u32,
    pub mask: u32,

    // alert thresholds
    pub connections: u32, // max distinct remote IPs per local IP (outbound)
    pub sessions: u32,    // max distinct port-tuple sessions per local IP
    pub ports: u32,       // per-(remote, proto) outbound port cap
    pub bytes: u64,       // per-(remote, proto) outbound byte cap
    pub packets: u32,     // per-(remote, proto) outbound packet cap

    // feature toggles
    pub flowmon: bool,
    pub rtmon: bool,
    pub pipeline: bool,
    pub perfmon: bool,

    pub flow_entries: u32,
    pub clean_interval: Duration,
    pub debug: bool,
    pub log_dir: PathBuf
}

impl Default for Config {
    fn default() -> Config {
        Config {
            iface: String::new(),
            cpus: 1,
            prefix: 0,
            mask: 0,
            // threshold defaults high enough to never fire
            connections: u32::MAX,
            sessions: u32::MAX,
            ports: u32::MAX,
            bytes: u64::MAX,
            packets: u32::MAX,
            flowmon: true,
            rtmon: false,
            pipeline: false,
            perfmon: false,
            flow_entries: 1 << 23,
            clean_interval: Duration::from_secs(10),
            debug: false,
            log_dir: PathBuf::from("./logs")
        }
    }
}
