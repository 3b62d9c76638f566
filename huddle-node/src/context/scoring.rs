//! Ranking and pruning formulas
//!
//! ```text
//! blended = cosine × 0.5^(age / half_life) × (1 + ln(max(access, 1)))
//! pruning = staleness_secs × 1 / (1 + access)
//! ```
//!
//! Higher blended scores rank first; higher pruning scores are pruned first.

use std::time::Duration;

/// Cosine similarity; `None` on dimension mismatch or a zero vector
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Halves every `half_life`
pub fn recency_decay(age: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 1.0;
    }
    0.5f64.powf(age.as_secs_f64() / half_life.as_secs_f64())
}

/// `1 + ln(access)`, with never-accessed fragments counted as one access
pub fn access_boost(access_count: u64) -> f64 {
    1.0 + (access_count.max(1) as f64).ln()
}

pub fn blended_score(similarity: f32, age: Duration, half_life: Duration, access_count: u64) -> f64 {
    f64::from(similarity) * recency_decay(age, half_life) * access_boost(access_count)
}

pub fn pruning_score(staleness: Duration, access_count: u64) -> f64 {
    staleness.as_secs_f64() / (1.0 + access_count as f64)
}
