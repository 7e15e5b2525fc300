//! Session timing math.
//!
//! Sessions never store elapsed or remaining time. Everything is derived
//! from the stored instants and counters, so a paused session reads the
//! same on every device no matter when it syncs:
//!
//! ```text
//! stop      = pause_date or now
//! elapsed   = (stop - start_date) - pause_seconds - adjustment_seconds
//! remaining = max(0, time_seconds - elapsed)
//! ```

use chrono::{DateTime, Utc};

use crate::model::Session;

impl Session {
    /// Seconds of countdown consumed so far. Zero until the session starts.
    ///
    /// A positive `adjustment_seconds` credits time back and can push this
    /// negative; a negative one burns time off the clock.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let Some(start) = self.start_date else {
            return 0;
        };
        let stop = self.pause_date.unwrap_or(now);
        (stop - start).num_seconds() - self.pause_seconds - self.adjustment_seconds
    }

    /// Seconds left on the clock, never negative.
    ///
    /// While paused this is frozen: `pause_date` pins the stop instant, so
    /// wall time passing does not change the result.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.time_seconds - self.elapsed_seconds(now)).max(0)
    }

    /// A session is paused when it was started, a pause is open, and time
    /// remains on the clock.
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.start_date.is_some() && self.pause_date.is_some() && self.remaining_seconds(now) > 0
    }

    /// A session is running when it was started, is not paused, was not
    /// fast-forwarded, and time remains on the clock.
    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.start_date.is_some()
            && !self.is_paused(now)
            && self.fast_forward_date.is_none()
            && self.remaining_seconds(now) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimerType;
    use crate::record_id::RecordId;
    use chrono::Duration;

    fn pomodoro(time_seconds: i64) -> Session {
        Session::new(RecordId::generate(), time_seconds, TimerType::Pomodoro)
    }

    fn t0() -> DateTime<Utc> {
        "2026-03-01T09:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_unstarted_session() {
        let session = pomodoro(1500);
        let now = t0();

        assert_eq!(session.elapsed_seconds(now), 0);
        assert_eq!(session.remaining_seconds(now), 1500);
        assert!(!session.is_paused(now));
        assert!(!session.is_running(now));
    }

    #[test]
    fn test_running_countdown() {
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());

        let now = t0() + Duration::seconds(600);
        assert_eq!(session.elapsed_seconds(now), 600);
        assert_eq!(session.remaining_seconds(now), 900);
        assert!(session.is_running(now));
        assert!(!session.is_paused(now));
    }

    #[test]
    fn test_pause_freezes_remaining() {
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());
        session.pause_date = Some(t0() + Duration::seconds(600));

        // Wall time keeps passing; remaining does not move
        for offset in [600, 800, 3600, 86400] {
            let now = t0() + Duration::seconds(offset);
            assert_eq!(session.remaining_seconds(now), 900);
            assert!(session.is_paused(now));
            assert!(!session.is_running(now));
        }
    }

    #[test]
    fn test_pause_resume_cycle() {
        // The full scenario: start a 1500s pomodoro at t0, pause at
        // t0+600, resume at t0+900. The 300s pause interval moves into
        // pause_seconds and the countdown picks up where it left off.
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());

        session.pause_date = Some(t0() + Duration::seconds(600));
        assert_eq!(session.remaining_seconds(t0() + Duration::seconds(900)), 900);

        // Resume
        session.pause_seconds += 300;
        session.pause_date = None;

        let now = t0() + Duration::seconds(1000);
        assert_eq!(session.elapsed_seconds(now), 700);
        assert_eq!(session.remaining_seconds(now), 800);
        assert!(session.is_running(now));
    }

    #[test]
    fn test_expired_session_is_neither_paused_nor_running() {
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());

        let now = t0() + Duration::seconds(1500);
        assert_eq!(session.remaining_seconds(now), 0);
        assert!(!session.is_running(now));

        // Even with an open pause, an expired session is not "paused"
        session.pause_date = Some(t0() + Duration::seconds(1500));
        assert!(!session.is_paused(now));
    }

    #[test]
    fn test_fast_forward_stops_running() {
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());
        session.fast_forward_date = Some(t0() + Duration::seconds(100));

        let now = t0() + Duration::seconds(200);
        assert!(!session.is_running(now));
        // Remaining still reads from the formula; the UI treats the
        // session as finished via the fast-forward flag
        assert_eq!(session.remaining_seconds(now), 1300);
    }

    #[test]
    fn test_positive_adjustment_adds_time() {
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());
        session.adjustment_seconds = 120;

        let now = t0() + Duration::seconds(60);
        // The 120s credit outweighs the 60s that actually elapsed
        assert_eq!(session.elapsed_seconds(now), -60);
        assert_eq!(session.remaining_seconds(now), 1560);
        assert!(session.is_running(now));
    }

    #[test]
    fn test_negative_adjustment_removes_time() {
        let mut session = pomodoro(1500);
        session.start_date = Some(t0());
        session.adjustment_seconds = -1500;

        let now = t0() + Duration::seconds(10);
        assert_eq!(session.remaining_seconds(now), 0);
        assert!(!session.is_running(now));
    }
}
