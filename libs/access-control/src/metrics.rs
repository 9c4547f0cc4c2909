use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

pub const METRICS_TICK_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AccessControlMetrics {
  total_permission_checks: Gauge,
  permission_checks_from_cache: Gauge,
}

impl AccessControlMetrics {
  fn init() -> Self {
    Self {
      total_permission_checks: Gauge::default(),
      permission_checks_from_cache: Gauge::default(),
    }
  }

  pub fn register(registry: &mut Registry) -> Self {
    let metrics = Self::init();
    let ac_registry = registry.sub_registry_with_prefix("ac");
    ac_registry.register(
      "total_permission_checks",
      "total permission check count",
      metrics.total_permission_checks.clone(),
    );

    ac_registry.register(
      "permission_checks_from_cache",
      "permission check results served from cache",
      metrics.permission_checks_from_cache.clone(),
    );

    metrics
  }

  pub fn record_permission_check_count(&self, total: i64, from_cache: i64) {
    self.total_permission_checks.set(total);
    self.permission_checks_from_cache.set(from_cache);
  }
}

#[derive(Clone)]
pub(crate) struct MetricsCalState {
  pub(crate) total_permission_checks: Arc<AtomicI64>,
  pub(crate) permission_checks_from_cache: Arc<AtomicI64>,
}

impl MetricsCalState {
  pub(crate) fn new() -> Self {
    Self {
      total_permission_checks: Arc::new(Default::default()),
      permission_checks_from_cache: Arc::new(Default::default()),
    }
  }
}

/// Flush the hot-path counters into the registered gauges on a fixed tick.
pub(crate) fn tick_metric(state: MetricsCalState, metrics: Arc<AccessControlMetrics>) {
  tokio::spawn(async move {
    let mut interval = interval(METRICS_TICK_INTERVAL);
    loop {
      interval.tick().await;

      metrics.record_permission_check_count(
        state.total_permission_checks.load(Ordering::Relaxed),
        state.permission_checks_from_cache.load(Ordering::Relaxed),
      );
    }
  });
}
