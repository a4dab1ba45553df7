//! Best-effort CPU and memory sampling for heartbeats.

use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// One resource snapshot of the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    /// CPU use since the previous sample, 100.0 = one full core.
    pub cpu_percent: f64,
    /// Resident set size in MiB.
    pub memory_mb: f64,
}

/// Source of resource snapshots.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> io::Result<ResourceSample>;
}

/// Sample, logging and zeroing any failure.
pub fn sample_or_zero(sampler: &dyn ResourceSampler) -> ResourceSample {
    match sampler.sample() {
        Ok(sample) => sample,
        Err(e) => {
            debug!(error = %e, "resource sampling failed");
            ResourceSample::default()
        }
    }
}

/// Samples the calling process via `getrusage` and `/proc/self/statm`.
#[derive(Debug)]
pub struct ProcessSampler {
    /// Wall clock and CPU time at the previous sample.
    last: Mutex<(Instant, Duration)>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let cpu = sys::cpu_time().unwrap_or_default();
        Self {
            last: Mutex::new((Instant::now(), cpu)),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&self) -> io::Result<ResourceSample> {
        let cpu = sys::cpu_time()?;
        let now = Instant::now();

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let (prev_wall, prev_cpu) = *last;
        *last = (now, cpu);
        drop(last);

        let wall = now.duration_since(prev_wall).as_secs_f64();
        let cpu_percent = if wall > 0.0 {
            cpu.saturating_sub(prev_cpu).as_secs_f64() / wall * 100.0
        } else {
            0.0
        };

        Ok(ResourceSample {
            cpu_percent,
            memory_mb: sys::resident_bytes()? as f64 / (1024.0 * 1024.0),
        })
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::time::Duration;

    fn rusage() -> io::Result<libc::rusage> {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: getrusage fills the struct it is handed; zeroed is a valid rusage.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: rc == 0 means the kernel initialized it.
        Ok(unsafe { usage.assume_init() })
    }

    fn timeval(tv: libc::timeval) -> Duration {
        Duration::from_secs(tv.tv_sec.max(0) as u64)
            + Duration::from_micros(tv.tv_usec.max(0) as u64)
    }

    pub fn cpu_time() -> io::Result<Duration> {
        let usage = rusage()?;
        Ok(timeval(usage.ru_utime) + timeval(usage.ru_stime))
    }

    pub fn resident_bytes() -> io::Result<u64> {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            let resident = statm
                .split_whitespace()
                .nth(1)
                .and_then(|field| field.parse::<u64>().ok());
            // SAFETY: sysconf has no preconditions.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if let (Some(pages), true) = (resident, page_size > 0) {
                return Ok(pages * page_size as u64);
            }
        }

        // Peak RSS: kilobytes on Linux, bytes on macOS.
        let max_rss = rusage()?.ru_maxrss.max(0) as u64;
        if cfg!(target_os = "macos") {
            Ok(max_rss)
        } else {
            Ok(max_rss * 1024)
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::time::Duration;

    pub fn cpu_time() -> io::Result<Duration> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process CPU sampling is unix-only",
        ))
    }

    pub fn resident_bytes() -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process memory sampling is unix-only",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl ResourceSampler for Broken {
        fn sample(&self) -> io::Result<ResourceSample> {
            Err(io::Error::new(io::ErrorKind::Other, "no /proc"))
        }
    }

    #[test]
    fn test_failure_reports_zeros() {
        assert_eq!(sample_or_zero(&Broken), ResourceSample::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_sampler_reports_memory() {
        let sampler = ProcessSampler::new();
        let mut busy = 0u64;
        for i in 0..200_000u64 {
            busy = busy.wrapping_add(i * i);
        }
        assert!(busy > 0);

        let sample = sampler.sample().unwrap();
        assert!(sample.memory_mb > 0.0);
        assert!(sample.cpu_percent >= 0.0);
    }
}
