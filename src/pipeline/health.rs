//! Pipeline health evaluation
//!
//! Four checks: queue pressure, flush recency, failure rate and flush
//! latency. One failing check is a warning, two or more are critical.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue usage at or above this share of capacity fails the queue check
pub const QUEUE_PRESSURE_RATIO: f64 = 0.9;

/// Failure rate at or above this value fails the failure check
pub const MAX_FAILURE_RATE: f64 = 0.01;

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// One named check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Result of a health evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub queue_size: usize,
    pub capacity: usize,
    pub failure_rate: f64,
    pub avg_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<u64>,
    pub timestamp: u64,
}

impl HealthReport {
    /// Names of the checks that failed
    pub fn failing_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Values a health evaluation is computed from
#[derive(Debug, Clone)]
pub(crate) struct HealthInputs {
    pub queue_size: usize,
    pub capacity: usize,
    pub last_flush_at: Option<u64>,
    pub now_ms: u64,
    pub flush_interval: Duration,
    pub failure_rate: f64,
    pub avg_latency: Duration,
    pub latency_threshold: Duration,
}

pub(crate) fn evaluate(inputs: &HealthInputs) -> HealthReport {
    let mut checks = Vec::with_capacity(4);

    let pressure_limit = inputs.capacity as f64 * QUEUE_PRESSURE_RATIO;
    checks.push(HealthCheck {
        name: "queue".to_string(),
        passed: (inputs.queue_size as f64) < pressure_limit,
        detail: format!("{}/{} buffered", inputs.queue_size, inputs.capacity),
    });

    // A flush counts as recent within two flush intervals. An empty queue
    // needs no flush.
    let window_ms = inputs.flush_interval.as_millis() as u64 * 2;
    let flush_recent = match inputs.last_flush_at {
        _ if inputs.queue_size == 0 => true,
        Some(at) => inputs.now_ms.saturating_sub(at) <= window_ms,
        None => false,
    };
    checks.push(HealthCheck {
        name: "flush".to_string(),
        passed: flush_recent,
        detail: match inputs.last_flush_at {
            Some(at) => format!("last flush {}ms ago", inputs.now_ms.saturating_sub(at)),
            None => "no flush yet".to_string(),
        },
    });

    checks.push(HealthCheck {
        name: "failureRate".to_string(),
        passed: inputs.failure_rate < MAX_FAILURE_RATE,
        detail: format!("{:.2}% permanent failures", inputs.failure_rate * 100.0),
    });

    checks.push(HealthCheck {
        name: "latency".to_string(),
        passed: inputs.avg_latency < inputs.latency_threshold,
        detail: format!(
            "average flush {}ms, threshold {}ms",
            inputs.avg_latency.as_millis(),
            inputs.latency_threshold.as_millis()
        ),
    });

    let failing = checks.iter().filter(|c| !c.passed).count();
    let status = match failing {
        0 => HealthStatus::Healthy,
        1 => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    };

    HealthReport {
        status,
        checks,
        queue_size: inputs.queue_size,
        capacity: inputs.capacity,
        failure_rate: inputs.failure_rate,
        avg_latency_ms: inputs.avg_latency.as_millis() as u64,
        last_flush_at: inputs.last_flush_at,
        timestamp: inputs.now_ms,
    }
}
