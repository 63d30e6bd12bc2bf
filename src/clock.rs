use std::time::Instant;

/// Upper bound on a single simulation step. Long gaps (a backgrounded window,
/// a debugger pause) collapse to one ordinary frame instead of exploding the
/// solver.
pub const MAX_DT: f32 = 0.016_666;
const MIN_DT: f32 = 1.0e-6;

#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    last_update: Instant,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self { last_update: now }
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_update = now;
    }

    pub fn tick(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f32();
        self.last_update = now;
        clamp_dt(elapsed)
    }
}

pub fn clamp_dt(elapsed: f32) -> f32 {
    if !elapsed.is_finite() {
        return MAX_DT;
    }
    elapsed.clamp(MIN_DT, MAX_DT)
}

#[cfg(test)]
mod tests {
    use super::{clamp_dt, FrameClock, MAX_DT};
    use std::time::{Duration, Instant};

    #[test]
    fn dt_is_capped_after_long_pause() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        let dt = clock.tick(start + Duration::from_secs(30));
        assert_eq!(dt, MAX_DT);
    }

    #[test]
    fn dt_is_positive_even_without_elapsed_time() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        let dt = clock.tick(start);
        assert!(dt > 0.0 && dt <= MAX_DT);
    }

    #[test]
    fn dt_stays_in_range_for_arbitrary_gaps() {
        for elapsed in [0.0, 1e-9, 0.001, 0.0166, 0.017, 1.0, f32::INFINITY, f32::NAN, -1.0] {
            let dt = clamp_dt(elapsed);
            assert!(dt > 0.0 && dt <= MAX_DT, "{elapsed} -> {dt}");
        }
    }

    #[test]
    fn short_frames_pass_through() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);
        let dt = clock.tick(start + Duration::from_millis(8));
        assert!((dt - 0.008).abs() < 1e-4);
    }
}
