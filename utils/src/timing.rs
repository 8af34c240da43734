// Helpers to handle budgeting subsystems based on time
//
// Austin Shafer - 2024
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Error getting system time")
}

/// Helper to get the current time in milliseconds
pub fn get_current_millis() -> u32 {
    get_current_time().as_millis() as u32
}

/// Manages subsystem timings
///
/// The motivation for this is the frame budget: input polling
/// should only block for whatever portion of the frame is not
/// spent rendering. This struct keeps track of how much time is
/// remaining before the next frame should start, and callers can
/// use that number for their timeout values.
pub struct TimingManager {
    // length of time we are counting down from
    tm_period: Duration,
    // the last time we reset this manager
    tm_start: Duration,
}

impl TimingManager {
    // create a new manager to track time
    // periods of length `period` ms
    pub fn new(period: u32) -> TimingManager {
        TimingManager {
            tm_period: Duration::from_millis(period as u64),
            tm_start: get_current_time(),
        }
    }

    // Reset the manager to the current time
    pub fn reset(&mut self) {
        self.tm_start = get_current_time();
    }

    // Returns true if period ms have passed
    // since this manager was reset
    pub fn is_overdue(&self) -> bool {
        get_current_time() - self.tm_start >= self.tm_period
    }

    // Returns the number of ms remaining in this
    // tracker
    //
    // If 0 is returned, it is overdue and we
    // should reset it.
    pub fn time_remaining(&self) -> usize {
        if self.is_overdue() {
            return 0;
        }
        let time_elapsed = get_current_time() - self.tm_start;
        return (self.tm_period - time_elapsed).as_millis() as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manager_is_not_overdue() {
        let tm = TimingManager::new(10000);
        assert!(!tm.is_overdue());
        assert!(tm.time_remaining() > 0);
    }

    #[test]
    fn zero_period_is_always_overdue() {
        let tm = TimingManager::new(0);
        assert!(tm.is_overdue());
        assert_eq!(tm.time_remaining(), 0);
    }
}
