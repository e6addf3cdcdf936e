use std::time::{Duration, Instant};
use tracing::info;

const STAT_SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Round trip bookkeeping for analyze calls, summarized in the log once a minute.
pub struct AnalysisStats {
    last_log_time: Instant,
    total_calls: usize,
    successes: usize,
    quota_failures: usize,
    transient_failures: usize,
    min_round_trip: Duration,
    max_round_trip: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    QuotaExceeded,
    Transient,
}

impl AnalysisStats {
    pub fn calculate_and_log_stats(&mut self, now: Instant, round_trip: Duration, outcome: CallOutcome) {
        self.max_round_trip = self.max_round_trip.max(round_trip);
        self.min_round_trip = self.min_round_trip.min(round_trip);
        self.total_calls += 1;
        match outcome {
            CallOutcome::Success => self.successes += 1,
            CallOutcome::QuotaExceeded => self.quota_failures += 1,
            CallOutcome::Transient => self.transient_failures += 1,
        }

        if now.duration_since(self.last_log_time) >= STAT_SUMMARY_INTERVAL {
            info!(
                "Stats: Total Calls: {}, Ok: {}, Quota: {}, Transient: {}, Min Round Trip: {:#?}, Max Round Trip: {:#?}",
                self.total_calls,
                self.successes,
                self.quota_failures,
                self.transient_failures,
                self.min_round_trip,
                self.max_round_trip
            );
            self.last_log_time = now;
        }
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls
    }

    pub fn quota_failures(&self) -> usize {
        self.quota_failures
    }

    pub fn round_trip_range(&self) -> Option<(Duration, Duration)> {
        (self.total_calls > 0).then_some((self.min_round_trip, self.max_round_trip))
    }
}

impl Default for AnalysisStats {
    fn default() -> Self {
        Self {
            last_log_time: Instant::now(),
            total_calls: 0,
            successes: 0,
            quota_failures: 0,
            transient_failures: 0,
            max_round_trip: Duration::ZERO,
            min_round_trip: Duration::from_secs_f64(1337.),
        }
    }
}
