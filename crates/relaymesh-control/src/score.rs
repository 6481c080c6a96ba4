//! Quality score heuristic for monitoring windows

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityBucket {
    Optimal,
    Degraded,
    Poor,
    /// Every probe in the window errored
    Failed,
}

impl QualityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityBucket::Optimal => "optimal",
            QualityBucket::Degraded => "degraded",
            QualityBucket::Poor => "poor",
            QualityBucket::Failed => "failed",
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score > 50.0 {
            QualityBucket::Optimal
        } else if score > 20.0 {
            QualityBucket::Degraded
        } else {
            QualityBucket::Poor
        }
    }
}

/// `max(0, 100 - (0.3*latency + 0.5*jitter + 2*loss))`
pub fn compute_score(avg_latency_ms: f64, jitter_ms: f64, packet_loss_percent: f64) -> f64 {
    let penalty = 0.3 * avg_latency_ms + 0.5 * jitter_ms + 2.0 * packet_loss_percent;
    (100.0 - penalty).max(0.0)
}

/// Aggregate of one probe window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub score: f64,
    pub bucket: QualityBucket,
}

impl Measurement {
    /// Summarize the latencies of successful probes out of `attempts`
    ///
    /// Jitter is the mean absolute difference between consecutive samples.
    pub fn from_latencies(latencies: &[f64], attempts: u32) -> Self {
        if latencies.is_empty() || attempts == 0 {
            return Self::failed();
        }

        let count = latencies.len() as f64;
        let latency_ms = latencies.iter().sum::<f64>() / count;
        let jitter_ms = if latencies.len() > 1 {
            latencies
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).abs())
                .sum::<f64>()
                / (count - 1.0)
        } else {
            0.0
        };
        let lost = attempts.saturating_sub(latencies.len() as u32);
        let packet_loss = f64::from(lost) * 100.0 / f64::from(attempts);
        let score = compute_score(latency_ms, jitter_ms, packet_loss);

        Self {
            latency_ms,
            jitter_ms,
            packet_loss,
            score,
            bucket: QualityBucket::from_score(score),
        }
    }

    pub fn failed() -> Self {
        Self {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss: 100.0,
            score: 0.0,
            bucket: QualityBucket::Failed,
        }
    }
}
