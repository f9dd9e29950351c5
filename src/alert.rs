use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

use super::headers;

// ALERTS
//
// The session_action() sink that threshold breaches fire into. Alerts are
// fire-and-forget: the analyzer records them and keeps capturing; acting on
// them (blocking, whitelisting) belongs to whoever tails the alert log.
//
//   AlertKind - Block | Whitelist
//   AlertSink - trait for alert receivers
//   LogSink - default sink: warn! line plus a JSON record per alert

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertKind {
    Block,
    Whitelist
}

impl AlertKind {
    pub fn name(self) -> &'static str {
        match self { AlertKind::Block => "block", AlertKind::Whitelist => "whitelist" }
    }
}

pub trait AlertSink: Send + Sync {
    fn session_action(&self, kind: AlertKind, ip: u32, reason: &str);
}

#[derive(Serialize)]
struct AlertRecord<'a> {
    time: u64,
    kind: &'static str,
    ip: String,
    reason: &'a str
}

pub struct LogSink {
    file: Option<Mutex<fs::File>>
}

impl LogSink {

    // A sink that cannot open its log file still raises warn! lines.
    pub fn new(log_dir: &Path) -> LogSink {
        let file = fs::create_dir_all(log_dir)
            .and_then(|_| {
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_dir.join("alerts.json"))
            });
        match file {
            Ok(f) => LogSink { file: Some(Mutex::new(f)) },
            Err(e) => {
                warn!("cannot open alert log in {}: {}", log_dir.display(), e);
                LogSink { file: None }
            }
        }
    }

}

impl AlertSink for LogSink {

    fn session_action(&self, kind: AlertKind, ip: u32, reason: &str) {
        warn!("pna alert {}: {} ({})", kind.name(), headers::ntop(ip), reason);
        if let Some(file) = &self.file {
            let record = AlertRecord {
                time: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                kind: kind.name(),
                ip: headers::ntop(ip),
                reason
            };
            if let Ok(line) = serde_json::to_string(&record) {
                let mut file = file.lock().unwrap();
                let _ = writeln!(file, "{}", line);
            }
        }
    }

}

// Recording sink for tests.
#[cfg(test)]
pub struct TestSink {
    pub alerts: Mutex<Vec<(AlertKind, u32, String)>>
}

#[cfg(test)]
impl TestSink {
    pub fn new() -> TestSink {
        TestSink { alerts: Mutex::new(Vec::new()) }
    }

    pub fn take(&self) -> Vec<(AlertKind, u32, String)> {
        std::mem::take(&mut *self.alerts.lock().unwrap())
    }
}

#[cfg(test)]
impl AlertSink for TestSink {
    fn session_action(&self, kind: AlertKind, ip: u32, reason: &str) {
        self.alerts.lock().unwrap().push((kind, ip, reason.to_string()));
    }
}
