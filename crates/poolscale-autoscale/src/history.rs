//! Capacity history used to size an empty pool.
//!
//! Every tick the controller records the pool's fulfilled capacity and the
//! CPUs it provided as metadata metrics. When the pool is later empty, the
//! ratio of the two over the most recent non-zero samples tells us how
//! many CPUs one capacity unit used to bring.

use tracing::debug;

use poolscale_core::{MetricKind, MetricSeries};
use poolscale_state::{MetricsSource, StateResult};

pub const FULFILLED_CAPACITY_METRIC: &str = "fulfilled_capacity";
pub const CPUS_TOTAL_METRIC: &str = "cpus_total";

/// How far back to look for history.
pub const HISTORY_WINDOW_SECS: u64 = 7 * 24 * 3600;
/// Number of latest non-zero samples averaged together.
pub const SMOOTHING: usize = 5;

/// Average of the latest `SMOOTHING` non-zero samples, with the time span
/// they cover.
fn smoothed_non_zero(series: &MetricSeries) -> Option<(u64, u64, f64)> {
    let non_zero: Vec<(u64, f64)> = series.iter().copied().filter(|(_, v)| *v > 0.0).collect();
    let latest = &non_zero[non_zero.len().saturating_sub(SMOOTHING)..];
    let (first, last) = (latest.first()?, latest.last()?);
    let mean = latest.iter().map(|(_, v)| v).sum::<f64>() / latest.len() as f64;
    Some((first.0, last.0, mean))
}

/// CPUs per capacity unit over the last week, or `None` without history.
pub fn historical_cpus_per_unit(
    source: &dyn MetricsSource,
    pool: &str,
    now: u64,
) -> StateResult<Option<f64>> {
    let start = now.saturating_sub(HISTORY_WINDOW_SECS);
    let capacity = source.get_metric_values(
        FULFILLED_CAPACITY_METRIC,
        MetricKind::Metadata,
        pool,
        start,
        now,
    )?;
    let Some((window_start, window_end, units)) = smoothed_non_zero(&capacity) else {
        return Ok(None);
    };

    let cpus = source.get_metric_values(
        CPUS_TOTAL_METRIC,
        MetricKind::Metadata,
        pool,
        window_start,
        window_end,
    )?;
    let factor = smoothed_non_zero(&cpus).map(|(_, _, cpus)| cpus / units);
    debug!(pool, units, ?factor, "historical cpus per unit");
    Ok(factor)
}
