//! Candidate scoring. Every score is clamped to `[0, 1]`.

use serde::{Deserialize, Serialize};

const DISTANCE_WEIGHT: f64 = 0.4;
const WAIT_WEIGHT: f64 = 0.3;
const COMPATIBILITY_WEIGHT: f64 = 0.2;
const FRESHNESS_WEIGHT: f64 = 0.1;

const WAIT_SATURATION_MS: f64 = 5.0 * 60.0 * 1000.0;
const FRESHNESS_HORIZON_HOURS: f64 = 24.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

const RADIUS_SPAN: f64 = 5000.0;
const RATING_SPAN: f64 = 5.0;
const RESPONSE_SPAN_MS: f64 = 10_000.0;
const NEUTRAL: f64 = 0.5;

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Per-session history used for compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_sessions: u32,
    /// Seconds spent in rooms, summed.
    pub total_chat_time: u64,
    pub preferred_radius: u32,
    /// Average response time in ms; `0` means no sample yet.
    pub response_time: u64,
    pub chat_rating: f64,
    pub join_time: i64,
}

impl SessionStats {
    pub fn fresh(preferred_radius: u32, join_time: i64) -> Self {
        SessionStats {
            total_sessions: 1,
            total_chat_time: 0,
            preferred_radius,
            response_time: 0,
            chat_rating: 5.0,
            join_time,
        }
    }
}

pub fn distance_score(distance_m: f64, radius_m: f64) -> f64 {
    if radius_m <= 0.0 {
        return 0.0;
    }
    unit(1.0 - distance_m / radius_m)
}

#[allow(clippy::cast_precision_loss)]
pub fn wait_time_score(waited_ms: i64) -> f64 {
    unit(waited_ms as f64 / WAIT_SATURATION_MS)
}

/// Weighted closeness of two sessions' radius, rating and response time.
/// Neutral when either side has no statistics.
pub fn compatibility_score(a: Option<&SessionStats>, b: Option<&SessionStats>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return NEUTRAL;
    };

    let radius =
        1.0 - (f64::from(a.preferred_radius) - f64::from(b.preferred_radius)).abs() / RADIUS_SPAN;
    let rating = 1.0 - (a.chat_rating - b.chat_rating).abs() / RATING_SPAN;
    #[allow(clippy::cast_precision_loss)]
    let response = if a.response_time > 0 && b.response_time > 0 {
        1.0 - a.response_time.abs_diff(b.response_time) as f64 / RESPONSE_SPAN_MS
    } else {
        NEUTRAL
    };

    unit(radius * 0.4 + rating * 0.4 + response * 0.2)
}

/// 1.0 for a pair that never matched, otherwise rises linearly back to 1.0
/// over the 24 hours after their last match.
#[allow(clippy::cast_precision_loss)]
pub fn freshness_score(last_match_ms: Option<i64>, now_ms: i64) -> f64 {
    match last_match_ms {
        None => 1.0,
        Some(at) => unit(now_ms.saturating_sub(at) as f64 / MS_PER_HOUR / FRESHNESS_HORIZON_HOURS),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub distance: f64,
    pub wait_time: f64,
    pub compatibility: f64,
    pub freshness: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        unit(
            self.distance * DISTANCE_WEIGHT
                + self.wait_time * WAIT_WEIGHT
                + self.compatibility * COMPATIBILITY_WEIGHT
                + self.freshness * FRESHNESS_WEIGHT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn stats(radius: u32, rating: f64, response: u64) -> SessionStats {
        SessionStats {
            response_time: response,
            chat_rating: rating,
            ..SessionStats::fresh(radius, 0)
        }
    }

    #[test]
    fn distance_falls_off_linearly() {
        assert!((distance_score(0.0, 1000.0) - 1.0).abs() < 1e-12);
        assert!((distance_score(250.0, 1000.0) - 0.75).abs() < 1e-12);
        assert_eq!(distance_score(1500.0, 1000.0), 0.0);
        assert_eq!(distance_score(10.0, 0.0), 0.0);
    }

    #[test]
    fn wait_saturates_after_five_minutes() {
        assert_eq!(wait_time_score(0), 0.0);
        assert!((wait_time_score(150_000) - 0.5).abs() < 1e-12);
        assert_eq!(wait_time_score(3_600_000), 1.0);
        assert_eq!(wait_time_score(-5), 0.0);
    }

    #[test]
    fn freshness_decays_back_over_a_day() {
        let t = 1_700_000_000_000;
        assert_eq!(freshness_score(None, t), 1.0);
        assert_eq!(freshness_score(Some(t), t), 0.0);
        assert!((freshness_score(Some(t), t + 12 * HOUR) - 0.5).abs() < 1e-12);
        assert_eq!(freshness_score(Some(t), t + 24 * HOUR), 1.0);
        assert_eq!(freshness_score(Some(t), t + 72 * HOUR), 1.0);
    }

    #[test]
    fn compatibility_defaults_and_weights() {
        let a = stats(1000, 5.0, 0);
        assert_eq!(compatibility_score(Some(&a), None), NEUTRAL);
        assert_eq!(compatibility_score(None, None), NEUTRAL);

        // identical radius and rating, no response samples
        assert!((compatibility_score(Some(&a), Some(&a)) - 0.9).abs() < 1e-12);

        let b = stats(1000, 5.0, 2000);
        let c = stats(1000, 5.0, 2000);
        assert!((compatibility_score(Some(&b), Some(&c)) - 1.0).abs() < 1e-12);

        let far = stats(6000, 0.0, 30_000);
        assert_eq!(compatibility_score(Some(&b), Some(&far)), 0.0);
    }

    #[test]
    fn every_score_stays_in_unit_range() {
        let radii = [500.0, 1000.0, 3000.0, 5000.0];
        let distances = [0.0, 1.0, 499.0, 1000.0, 2500.0, 20_000.0, f64::MAX];
        let waits = [i64::MIN, -1, 0, 1, 299_999, 300_000, i64::MAX];
        let samples = [
            None,
            Some(stats(500, 0.0, 0)),
            Some(stats(5000, 5.0, 1)),
            Some(stats(u32::MAX, -3.0, u64::MAX)),
        ];
        let lasts = [None, Some(0), Some(i64::MAX / 2), Some(-HOUR)];

        for radius in radii {
            for distance in distances {
                for wait in waits {
                    for (a, b) in samples.iter().zip(samples.iter().rev()) {
                        for last in lasts {
                            let scores = ScoreBreakdown {
                                distance: distance_score(distance, radius),
                                wait_time: wait_time_score(wait),
                                compatibility: compatibility_score(a.as_ref(), b.as_ref()),
                                freshness: freshness_score(last, 1_700_000_000_000),
                            };
                            for value in [
                                scores.distance,
                                scores.wait_time,
                                scores.compatibility,
                                scores.freshness,
                                scores.total(),
                            ] {
                                assert!((0.0..=1.0).contains(&value), "{scores:?}");
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn total_uses_weights() {
        let scores = ScoreBreakdown {
            distance: 1.0,
            wait_time: 0.0,
            compatibility: 0.5,
            freshness: 1.0,
        };
        assert!((scores.total() - 0.6).abs() < 1e-12);
    }
}
