use std::time::{Duration, Instant};

use tracing::info;

use super::flowkey::{Dir, DIRECTIONS};

// THROUGHPUT SAMPLING
//
// Fixed-interval frame/byte rate sampling, one sampler per packet-touching
// context (the dispatcher of each shard, and every pipeline worker). The
// same interval logic used to be duplicated at each site; this is the one
// shared copy.
//
//   IntervalSampler - per-direction fps/Mbps/average-frame sampler
//   new(name, shard) -> IntervalSampler
//   update(Dir, frame_len) - account one frame, emitting a report when the
//       interval deadline has passed
//
// Accounted bytes include the 20 octets of per-frame Ethernet overhead
// (12 interframe gap + 8 preamble). A report line is only emitted when the
// combined rate exceeds 1000 fps, to keep idle links quiet.

pub const PERF_INTERVAL: Duration = Duration::from_secs(10);

// 12 octet interframe gap + 8 octet preamble
pub const ETH_OVERHEAD: u32 = 20;

// noise gate: don't report links slower than this
const REPORT_MIN_FPS: u64 = 1000;

pub struct IntervalSampler {
    name: &'static str,
    shard: usize,
    deadline: Instant,
    prev: Instant,
    p_interval: [u64; DIRECTIONS],
    b_interval: [u64; DIRECTIONS]
}

impl IntervalSampler {

    pub fn new(name: &'static str, shard: usize) -> IntervalSampler {
        let now = Instant::now();
        IntervalSampler {
            name,
            shard,
            deadline: now + PERF_INTERVAL,
            prev: now,
            p_interval: [0; DIRECTIONS],
            b_interval: [0; DIRECTIONS]
        }
    }

    #[inline]
    pub fn update(&mut self, dir: Dir, frame_len: u32) {
        let now = Instant::now();
        if now >= self.deadline {
            self.sample(now);
        }
        self.p_interval[dir.index()] += 1;
        self.b_interval[dir.index()] += (frame_len + ETH_OVERHEAD) as u64;
    }

    fn sample(&mut self, now: Instant) {
        let t_interval = now.duration_since(self.prev).as_secs().max(1);
        self.prev = now;

        let rate = |d: usize| -> (u64, u64, u64) {
            let fps = self.p_interval[d] / t_interval;
            // 125000 = (1000 KB/MB * 1000 B/KB) / 8 bits per byte
            let mbps = self.b_interval[d] / 125000 / t_interval;
            let avg = if self.p_interval[d] != 0 {
                (self.b_interval[d] / self.p_interval[d])
                    .saturating_sub(ETH_OVERHEAD as u64)
            } else { 0 };
            (fps, mbps, avg)
        };
        let (fps_in, mbps_in, avg_in) = rate(Dir::Inbound.index());
        let (fps_out, mbps_out, avg_out) = rate(Dir::Outbound.index());

        if fps_in + fps_out > REPORT_MIN_FPS {
            info!("pna {} shard:{}, in:{{fps:{},Mbps:{},avg:{}}}, \
                   out:{{fps:{},Mbps:{},avg:{}}}",
                  self.name, self.shard,
                  fps_in, mbps_in, avg_in,
                  fps_out, mbps_out, avg_out);
        }

        self.p_interval = [0; DIRECTIONS];
        self.b_interval = [0; DIRECTIONS];
        self.deadline = now + PERF_INTERVAL;
    }

}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn accumulates_per_direction() {
        let mut perf = IntervalSampler::new("selftest", 0);
        perf.update(Dir::Inbound, 100);
        perf.update(Dir::Inbound, 100);
        perf.update(Dir::Outbound, 60);
        assert_eq!(perf.p_interval, [2, 1]);
        assert_eq!(perf.b_interval, [240, 80]); // frame + 20 overhead each
    }

    #[test]
    fn interval_rollover_resets_counters() {
        let mut perf = IntervalSampler::new("selftest", 0);
        perf.update(Dir::Outbound, 60);
        // force the deadline into the past; the next update samples first
        perf.deadline = Instant::now() - Duration::from_secs(1);
        perf.update(Dir::Outbound, 60);
        assert_eq!(perf.p_interval, [0, 1]);
        assert_eq!(perf.b_interval, [0, 80]);
        assert!(perf.deadline > Instant::now());
    }
}
