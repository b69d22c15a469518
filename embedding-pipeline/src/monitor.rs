use std::{fs, sync::Mutex, time::Instant};

use tracing::debug;

/// Scheduler ticks per second assumed for `/proc/self/stat` times. This is the usual
/// Linux `USER_HZ`; the value is not queried from the system.
const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

/// Best-effort process instrumentation. `None` means the reading is unavailable.
pub trait ResourceMonitor: Send + Sync {
    /// Process CPU usage since the previous call, in percent of one core.
    fn cpu_percent(&self) -> Option<f32>;

    /// Resident memory of the process in MB.
    fn process_memory_mb(&self) -> Option<f64>;

    /// Accelerator memory in use, in MB.
    fn device_memory_used(&self) -> Option<f64>;
}

/// Reports nothing. Used when instrumentation is not wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl ResourceMonitor for NoopMonitor {
    fn cpu_percent(&self) -> Option<f32> {
        None
    }

    fn process_memory_mb(&self) -> Option<f64> {
        None
    }

    fn device_memory_used(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    at: Instant,
    ticks: u64,
}

/// Samples `/proc/self` on Linux; every reading degrades to `None` elsewhere.
#[derive(Debug, Default)]
pub struct ProcfsMonitor {
    last: Mutex<Option<CpuSample>>,
}

impl ProcfsMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceMonitor for ProcfsMonitor {
    /// CPU time is converted from clock ticks assuming a `USER_HZ` of 100. On a kernel
    /// built with another value the percentage is scaled by `100 / USER_HZ`.
    fn cpu_percent(&self) -> Option<f32> {
        let ticks = read_cpu_ticks()?;
        let now = CpuSample {
            at: Instant::now(),
            ticks,
        };
        let mut last = self.last.lock().ok()?;
        let previous = last.replace(now);

        let Some(previous) = previous else {
            return Some(0.0);
        };
        let elapsed = now.at.duration_since(previous.at).as_secs_f64();
        Some(ticks_to_percent(
            now.ticks.saturating_sub(previous.ticks),
            elapsed,
        ))
    }

    fn process_memory_mb(&self) -> Option<f64> {
        let status = fs::read_to_string("/proc/self/status")
            .map_err(|err| debug!(error = %err, "process memory unavailable"))
            .ok()?;
        parse_vm_rss_mb(&status)
    }

    fn device_memory_used(&self) -> Option<f64> {
        None
    }
}

/// Percent of one core spent over `elapsed_secs`, at [`CLOCK_TICKS_PER_SECOND`].
fn ticks_to_percent(ticks: u64, elapsed_secs: f64) -> f32 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let busy = ticks as f64 / CLOCK_TICKS_PER_SECOND;
    #[allow(clippy::cast_possible_truncation)]
    let percent = (busy / elapsed_secs * 100.0) as f32;
    percent
}

fn read_cpu_ticks() -> Option<u64> {
    let stat = fs::read_to_string("/proc/self/stat")
        .map_err(|err| debug!(error = %err, "process cpu time unavailable"))
        .ok()?;
    parse_cpu_ticks(&stat)
}

/// utime + stime from a `/proc/<pid>/stat` line. The command name may contain spaces,
/// so fields are counted from the closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

fn parse_vm_rss_mb(status: &str) -> Option<f64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    #[allow(clippy::cast_precision_loss)]
    Some(kb as f64 / 1024.0)
}
