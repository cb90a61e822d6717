//! Distance kernels.
//!
//! All kernels return "smaller is closer" values so the graph code never
//! branches on the metric direction.

use crate::protocol::MetricKind;

/// Squared euclidean distance.
#[must_use]
#[inline]
pub fn l2sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Cosine distance, `1 - cos(a, b)`.
///
/// A zero vector is at distance 1 from everything.
#[must_use]
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).max(0.0)
}

/// Number of differing bits.
#[must_use]
#[inline]
#[allow(clippy::cast_precision_loss)] // at most 65536 bits
pub fn hamming(a: &[u32], b: &[u32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x ^ y).count_ones())
        .sum::<u32>() as f32
}

/// Dense distance for a float metric.
///
/// Hamming indexes never store dense points; they fall back to `l2sq` here.
#[must_use]
#[inline]
pub fn dense(metric: MetricKind, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricKind::L2sq | MetricKind::Hamming => l2sq(a, b),
        MetricKind::Cos => cosine(a, b),
    }
}
