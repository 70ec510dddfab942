//! Small numeric helpers shared by the command encoders, plus the bounded
//! polling loop behind every "wait until …" call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Clamp a motor power/speed to −100..=100.
///
/// 127 is passed through untouched: on the wire it means "brake".
pub fn map_speed(speed: i32) -> i8 {
    if speed == 127 {
        return 127;
    }
    speed.clamp(-100, 100) as i8
}

/// Fold an angle in degrees into −180..180.
pub fn normalize_angle(angle: i32) -> i32 {
    ((i64::from(angle) + 180).rem_euclid(360) - 180) as i32
}

/// Snap an angle to the closest of −180, −90, 0 and 90.
pub fn round_angle_to_nearest_90(angle: i32) -> i32 {
    let angle = normalize_angle(angle);
    match angle {
        a if a < -135 => -180,
        a if a < -45 => -90,
        a if a < 45 => 0,
        a if a < 135 => 90,
        _ => -180,
    }
}

/// Sensor color codes 1 and 5 are reported one below the palette entry.
pub fn parse_color(color: u8) -> u8 {
    if color == 1 || color == 5 {
        color + 1
    } else {
        color
    }
}

// ── Ramps ─────────────────────────────────────────────────────────────────────

/// Step plan for a gradual power/brightness change.
///
/// One step per unit of change, spread over `time_ms`.  Steps are never
/// shorter than 50 ms; when they would be, the per-step increment grows
/// instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Ramp {
    from: i32,
    to: i32,
    increment: f64,
    pub delay: Duration,
}

impl Ramp {
    pub fn new(from: i32, to: i32, time_ms: u64) -> Self {
        let steps = (i64::from(to) - i64::from(from)).unsigned_abs() as f64;
        let mut delay = if steps > 0.0 {
            time_ms as f64 / steps
        } else {
            time_ms as f64
        };
        let mut increment = 1.0;
        if delay < 50.0 && steps > 0.0 {
            increment = 50.0 / delay.max(f64::MIN_POSITIVE);
            delay = 50.0;
        }
        if from > to {
            increment = -increment;
        }
        Self {
            from,
            to,
            increment,
            delay: Duration::from_micros((delay * 1000.0) as u64),
        }
    }

    /// The values emitted at each tick, ending exactly on the target.
    pub fn values(&self) -> Vec<i32> {
        let mut out = Vec::new();
        let mut i = 0u32;
        loop {
            i += 1;
            let mut value = (self.from as f64 + i as f64 * self.increment).round() as i32;
            if self.to > self.from && value > self.to || self.from > self.to && value < self.to {
                value = self.to;
            }
            if self.from == self.to {
                value = self.to;
            }
            out.push(value);
            if value == self.to {
                return out;
            }
        }
    }
}

// ── Bounded waits ─────────────────────────────────────────────────────────────

/// Poll `check` every `retry` until it yields a value or `timeout` elapses.
///
/// `check` runs at least once.  On expiry the error carries the elapsed time.
pub async fn wait_for<T, F, Fut>(timeout: Duration, retry: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        tokio::time::sleep(retry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_speed() {
        assert_eq!(map_speed(127), 127);
        assert_eq!(map_speed(150), 100);
        assert_eq!(map_speed(-150), -100);
        assert_eq!(map_speed(-42), -42);
    }

    #[test]
    fn test_normalize_angle() {
        assert_eq!(normalize_angle(90), 90);
        assert_eq!(normalize_angle(179), 179);
        assert_eq!(normalize_angle(190), -170);
        assert_eq!(normalize_angle(-190), 170);
        assert_eq!(normalize_angle(-180), -180);
        assert_eq!(normalize_angle(540), 180 - 360);
    }

    #[test]
    fn test_normalize_angle_extremes() {
        assert_eq!(normalize_angle(i32::MAX), 127);
        assert_eq!(normalize_angle(i32::MIN), -128);
        assert_eq!(normalize_angle(-181), 179);
    }

    #[test]
    fn test_round_angle_to_nearest_90() {
        assert_eq!(round_angle_to_nearest_90(10), 0);
        assert_eq!(round_angle_to_nearest_90(80), 90);
        assert_eq!(round_angle_to_nearest_90(-100), -90);
        assert_eq!(round_angle_to_nearest_90(170), -180);
    }

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color(1), 2);
        assert_eq!(parse_color(5), 6);
        assert_eq!(parse_color(9), 9);
    }

    #[test]
    fn test_ramp_slow_steps_by_one() {
        let ramp = Ramp::new(0, 5, 1000);
        assert_eq!(ramp.delay, Duration::from_millis(200));
        assert_eq!(ramp.values(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_ramp_fast_enforces_minimum_delay() {
        let ramp = Ramp::new(100, 0, 500);
        assert_eq!(ramp.delay, Duration::from_millis(50));
        let values = ramp.values();
        assert_eq!(values.first(), Some(&90));
        assert_eq!(values.last(), Some(&0));
        assert_eq!(values.len(), 10);
    }

    #[test]
    fn test_ramp_across_full_i32_range() {
        let values = Ramp::new(i32::MIN, i32::MAX, 1000).values();
        assert_eq!(values.last(), Some(&i32::MAX));
        assert!(values.len() <= 21);
    }

    #[test]
    fn test_ramp_to_same_value_finishes_at_once() {
        assert_eq!(Ramp::new(30, 30, 100).values(), vec![30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_with_elapsed() {
        let err = wait_for(Duration::from_millis(100), Duration::from_millis(20), || async {
            None::<()>
        })
        .await
        .unwrap_err();
        match err {
            Error::Timeout { elapsed_ms } => assert!(elapsed_ms >= 100),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_returns_first_hit() {
        let mut calls = 0;
        let value = wait_for(Duration::from_secs(1), Duration::from_millis(20), || {
            calls += 1;
            let hit = (calls == 3).then_some(calls);
            async move { hit }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }
}
