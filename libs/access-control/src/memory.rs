use std::sync::atomic::{AtomicU64, Ordering};

/// Reports how much of the available memory budget is in use, as a ratio in
/// `0.0..=1.0`. The GC policies compare the ratio against their configured
/// threshold; the probe itself carries no policy.
pub trait MemoryPressure: Send + Sync + 'static {
  fn usage_ratio(&self) -> f64;
}

/// Reads system memory statistics from `/proc/meminfo`. On platforms or
/// errors where the file is unavailable the probe reports no pressure,
/// which keeps the caches on their normal maintenance interval.
#[derive(Debug, Default, Clone)]
pub struct SystemMemoryPressure;

impl MemoryPressure for SystemMemoryPressure {
  fn usage_ratio(&self) -> f64 {
    match read_meminfo() {
      Some((total, available)) if total > 0 => 1.0 - (available as f64 / total as f64),
      _ => 0.0,
    }
  }
}

fn read_meminfo() -> Option<(u64, u64)> {
  let content = std::fs::read_to_string("/proc/meminfo").ok()?;
  let mut total = None;
  let mut available = None;
  for line in content.lines() {
    if let Some(rest) = line.strip_prefix("MemTotal:") {
      total = parse_kb(rest);
    } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
      available = parse_kb(rest);
    }
    if total.is_some() && available.is_some() {
      break;
    }
  }
  Some((total?, available?))
}

fn parse_kb(rest: &str) -> Option<u64> {
  rest.trim().split_whitespace().next()?.parse().ok()
}

/// A probe with a settable ratio, for tests and for deployments that feed
/// the ratio from an external monitor.
#[derive(Debug, Default)]
pub struct StaticMemoryPressure {
  ratio_bits: AtomicU64,
}

impl StaticMemoryPressure {
  pub fn new(ratio: f64) -> Self {
    Self {
      ratio_bits: AtomicU64::new(ratio.to_bits()),
    }
  }

  pub fn set(&self, ratio: f64) {
    self.ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
  }
}

impl MemoryPressure for StaticMemoryPressure {
  fn usage_ratio(&self) -> f64 {
    f64::from_bits(self.ratio_bits.load(Ordering::Relaxed))
  }
}
