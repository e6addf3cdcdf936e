use crate::{
    analyzer::Analyze,
    api::AnalysisResult,
    capture::{Capture, EncodedFrame},
    error::{AnalyzeError, CaptureError},
    history::Board,
    stats::{AnalysisStats, CallOutcome},
    utils::save_annotated_frame,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub normal_interval: Duration,
    /// Backoff after the first quota failure, doubled for each further one.
    pub floor: Duration,
    pub ceiling: Duration,
    pub recheck_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            normal_interval: Duration::from_millis(20_000),
            floor: Duration::from_millis(10_000),
            ceiling: Duration::from_millis(120_000),
            recheck_interval: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// `min(floor * 2^(failures - 1), ceiling)`, zero when there were no failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.floor.saturating_mul(1u32 << exponent).min(self.ceiling)
    }

    pub fn transient_delay(&self) -> Duration {
        self.normal_interval * 3 / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Waiting { until: Instant },
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Analyzed,
    NoFrame,
    QuotaExceeded,
    Transient,
    /// The frame cannot be read. Shown to the user, never retried by backoff.
    SecurityRestriction(String),
    /// Fatal; the loop stops.
    Configuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Run,
    Recheck { until: Instant },
}

#[derive(Debug, Clone)]
pub struct Schedule {
    policy: BackoffPolicy,
    phase: Phase,
    consecutive_quota_failures: u32,
    next_eligible_at: Option<Instant>,
    rate_limited: bool,
    banner: Option<String>,
}

impl Schedule {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            phase: Phase::Stopped,
            consecutive_quota_failures: 0,
            next_eligible_at: None,
            rate_limited: false,
            banner: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn consecutive_quota_failures(&self) -> u32 {
        self.consecutive_quota_failures
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.next_eligible_at
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn start(&mut self) {
        self.phase = Phase::Running;
    }

    /// Applies the outcome of the cycle that just finished and returns the next phase.
    pub fn complete(&mut self, outcome: &CycleOutcome, now: Instant) -> Phase {
        let delay = match outcome {
            CycleOutcome::Analyzed => {
                self.consecutive_quota_failures = 0;
                self.next_eligible_at = None;
                self.rate_limited = false;
                self.banner = None;
                self.policy.normal_interval
            }
            CycleOutcome::QuotaExceeded => {
                self.consecutive_quota_failures = self.consecutive_quota_failures.saturating_add(1);
                let backoff = self.policy.backoff(self.consecutive_quota_failures);
                let eligible = now + backoff;
                self.next_eligible_at = Some(self.next_eligible_at.map_or(eligible, |t| t.max(eligible)));
                self.rate_limited = true;
                backoff
            }
            CycleOutcome::Transient => self.policy.transient_delay(),
            CycleOutcome::SecurityRestriction(message) => {
                self.banner = Some(message.clone());
                self.policy.normal_interval
            }
            CycleOutcome::NoFrame => self.policy.normal_interval,
            CycleOutcome::Configuration(message) => {
                self.stop();
                self.banner = Some(message.clone());
                return self.phase;
            }
        };
        self.phase = Phase::Waiting { until: now + delay };
        self.phase
    }

    pub fn on_wake(&mut self, now: Instant) -> Readiness {
        match self.next_eligible_at {
            Some(eligible) if now < eligible => {
                let until = now + self.policy.recheck_interval;
                self.phase = Phase::Waiting { until };
                Readiness::Recheck { until }
            }
            _ => {
                self.phase = Phase::Running;
                Readiness::Run
            }
        }
    }

    /// Forgets the backoff so the pending wait ends right away.
    pub fn manual_override(&mut self, now: Instant) {
        self.consecutive_quota_failures = 0;
        self.next_eligible_at = None;
        self.rate_limited = false;
        if let Phase::Waiting { .. } = self.phase {
            self.phase = Phase::Waiting { until: now };
        }
    }

    pub fn stop(&mut self) {
        self.phase = Phase::Stopped;
        self.consecutive_quota_failures = 0;
        self.next_eligible_at = None;
        self.rate_limited = false;
    }

    pub fn retry_countdown_secs(&self, now: Instant) -> u64 {
        if !self.rate_limited {
            return 0;
        }
        self.next_eligible_at
            .map(|t| t.saturating_duration_since(now))
            .map(|left| left.as_millis().div_ceil(1000) as u64)
            .unwrap_or(0)
    }

    pub fn status(&self, now: Instant, in_flight: usize) -> ScheduleStatus {
        let (phase, next_cycle_in_ms) = match self.phase {
            Phase::Stopped => (PhaseKind::Stopped, None),
            Phase::Running => (PhaseKind::Running, None),
            Phase::Waiting { until } => (
                PhaseKind::Waiting,
                Some(until.saturating_duration_since(now).as_millis() as u64),
            ),
        };
        ScheduleStatus {
            phase,
            is_rate_limited: self.rate_limited,
            retry_countdown_secs: self.retry_countdown_secs(now),
            consecutive_quota_failures: self.consecutive_quota_failures,
            next_cycle_in_ms,
            banner: self.banner.clone(),
            in_flight,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    #[default]
    Stopped,
    Waiting,
    Running,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    pub phase: PhaseKind,
    pub is_rate_limited: bool,
    pub retry_countdown_secs: u64,
    pub consecutive_quota_failures: u32,
    pub next_cycle_in_ms: Option<u64>,
    /// One line for the user, never a raw error payload.
    pub banner: Option<String>,
    pub in_flight: usize,
}

struct FlightGuard<'a>(&'a AtomicUsize);

impl<'a> FlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct CycleReport {
    outcome: CycleOutcome,
    analysis: Option<(AnalysisResult, EncodedFrame)>,
}

impl From<CycleOutcome> for CycleReport {
    fn from(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            analysis: None,
        }
    }
}

pub struct Scheduler<C, A> {
    capture: Arc<C>,
    analyzer: Arc<A>,
    board: Arc<RwLock<Board>>,
    policy: BackoffPolicy,
    status: Arc<watch::Sender<ScheduleStatus>>,
    stats: Arc<Mutex<AnalysisStats>>,
    in_flight: Arc<AtomicUsize>,
    image_path: Option<String>,
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    retry: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ends a rate-limited wait, forgetting the backoff. Ignored otherwise.
    pub fn manual_override(&self) {
        self.retry.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the loop and waits for it, so nothing is written afterwards.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Analysis loop panicked: {}", e);
            }
        }
    }
}

impl<C: Capture, A: Analyze> Scheduler<C, A> {
    pub fn new(
        capture: Arc<C>,
        analyzer: Arc<A>,
        board: Arc<RwLock<Board>>,
        policy: BackoffPolicy,
        status: Arc<watch::Sender<ScheduleStatus>>,
    ) -> Self {
        Self {
            capture,
            analyzer,
            board,
            policy,
            status,
            stats: Arc::new(Mutex::new(AnalysisStats::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            image_path: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<Mutex<AnalysisStats>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_image_path(mut self, image_path: Option<String>) -> Self {
        self.image_path = image_path;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let retry = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(cancel.clone(), retry.clone()));
        SchedulerHandle {
            cancel,
            retry,
            task,
        }
    }

    fn publish(&self, schedule: &Schedule) {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        self.status.send_replace(schedule.status(Instant::now(), in_flight));
    }

    async fn run(self, cancel: CancellationToken, retry: Arc<Notify>) {
        let mut schedule = Schedule::new(self.policy);
        schedule.start();
        info!("Analysis loop started, interval {:?}", self.policy.normal_interval);

        'cycles: loop {
            self.publish(&schedule);
            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'cycles,
                report = self.cycle() => report,
            };
            if cancel.is_cancelled() {
                break 'cycles;
            }

            if let Some((result, frame)) = report.analysis {
                {
                    let mut board = self.board.write().await;
                    if cancel.is_cancelled() {
                        break 'cycles;
                    }
                    board.record(result.clone());
                }
                if let Some(image_path) = &self.image_path {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'cycles,
                        saved = save_annotated_frame(&frame, &result, image_path) => {
                            if let Err(e) = saved {
                                warn!("Failed to save annotated frame: {}", e);
                            }
                        }
                    }
                }
            }

            let now = Instant::now();
            if let Phase::Stopped = schedule.complete(&report.outcome, now) {
                error!("Analysis stopped: {}", schedule.banner().unwrap_or("fatal error"));
                self.publish(&schedule);
                return;
            }
            if let CycleOutcome::QuotaExceeded = report.outcome {
                warn!(
                    "Quota exceeded {} time(s) in a row, next attempt in {}s",
                    schedule.consecutive_quota_failures(),
                    schedule.retry_countdown_secs(now)
                );
            }

            loop {
                self.publish(&schedule);
                let Phase::Waiting { until } = schedule.phase() else {
                    break;
                };
                let now = Instant::now();
                if now >= until {
                    match schedule.on_wake(now) {
                        Readiness::Run => break,
                        Readiness::Recheck { .. } => {
                            debug!("Woke before the backoff elapsed, checking again shortly");
                            continue;
                        }
                    }
                }

                let wake = if schedule.is_rate_limited() {
                    until.min(now + COUNTDOWN_TICK)
                } else {
                    until
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'cycles,
                    _ = retry.notified() => {
                        if schedule.is_rate_limited() {
                            info!("Manual retry requested");
                            schedule.manual_override(Instant::now());
                        } else {
                            debug!("Ignoring manual retry, not rate limited");
                        }
                    }
                    _ = sleep_until(wake) => {}
                }
            }
        }

        schedule.stop();
        self.publish(&schedule);
        info!("Analysis loop stopped");
    }

    async fn cycle(&self) -> CycleReport {
        let frame = match self.capture.capture().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("No frame available, skipping cycle");
                return CycleOutcome::NoFrame.into();
            }
            Err(e @ CaptureError::SecurityRestriction) => {
                warn!("{}", e);
                return CycleOutcome::SecurityRestriction(e.to_string()).into();
            }
            Err(e) => {
                warn!("Frame capture failed: {}", e);
                return CycleOutcome::Transient.into();
            }
        };
        debug!(
            "Captured {}x{} frame, {} bytes",
            frame.width,
            frame.height,
            frame.jpeg.len()
        );

        let start = std::time::Instant::now();
        let result = {
            let _flight = FlightGuard::enter(&self.in_flight);
            let in_flight = self.in_flight.load(Ordering::SeqCst);
            self.status.send_modify(|status| status.in_flight = in_flight);
            self.analyzer.analyze(frame.clone()).await
        };
        let round_trip = start.elapsed();

        let (report, call) = match result {
            Ok(result) => {
                info!(
                    "Analyzed frame in {:#?}: {} vehicles, {} congestion",
                    round_trip, result.vehicle_count, result.congestion_level
                );
                (
                    CycleReport {
                        outcome: CycleOutcome::Analyzed,
                        analysis: Some((result, frame)),
                    },
                    CallOutcome::Success,
                )
            }
            Err(AnalyzeError::QuotaExceeded(message)) => {
                debug!("Quota failure: {}", message);
                (CycleOutcome::QuotaExceeded.into(), CallOutcome::QuotaExceeded)
            }
            Err(AnalyzeError::Transient(message)) => {
                warn!("Analysis failed: {}", message);
                (CycleOutcome::Transient.into(), CallOutcome::Transient)
            }
            Err(e @ AnalyzeError::Configuration(_)) => {
                return CycleOutcome::Configuration(e.to_string()).into();
            }
        };

        self.stats
            .lock()
            .await
            .calculate_and_log_stats(std::time::Instant::now(), round_trip, call);
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::CongestionLevel;
    use chrono::Local;
    use std::{collections::VecDeque, sync::Mutex as StdMutex};

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            normal_interval: Duration::from_millis(20_000),
            floor: Duration::from_millis(10_000),
            ceiling: Duration::from_millis(120_000),
            recheck_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn backoff_doubles_until_ceiling() {
        let policy = policy();
        let expected = [10, 20, 40, 80, 120, 120, 120];
        for (n, secs) in (1..).zip(expected) {
            assert_eq!(policy.backoff(n), Duration::from_secs(secs), "n = {n}");
        }
        for n in 1..4 {
            assert!(policy.backoff(n) < policy.backoff(n + 1));
        }
        assert_eq!(policy.backoff(u32::MAX), policy.ceiling);
        assert_eq!(policy.backoff(0), Duration::ZERO);
    }

    #[test]
    fn quota_failures_back_off_and_set_rate_limited() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let t0 = Instant::now();

        let mut now = t0;
        for secs in [10, 20, 40] {
            let phase = schedule.complete(&CycleOutcome::QuotaExceeded, now);
            assert_eq!(phase, Phase::Waiting { until: now + Duration::from_secs(secs) });
            assert!(schedule.is_rate_limited());
            assert_eq!(schedule.retry_countdown_secs(now), secs);
            now += Duration::from_secs(secs);
            assert_eq!(schedule.on_wake(now), Readiness::Run);
        }
        assert_eq!(schedule.consecutive_quota_failures(), 3);
    }

    #[test]
    fn success_resets_everything() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let now = Instant::now();
        schedule.complete(&CycleOutcome::QuotaExceeded, now);
        schedule.complete(&CycleOutcome::SecurityRestriction("blocked".into()), now);
        schedule.complete(&CycleOutcome::Analyzed, now);

        assert_eq!(schedule.consecutive_quota_failures(), 0);
        assert!(!schedule.is_rate_limited());
        assert_eq!(schedule.next_eligible_at(), None);
        assert_eq!(schedule.banner(), None);
        assert_eq!(schedule.phase(), Phase::Waiting { until: now + Duration::from_secs(20) });
    }

    #[test]
    fn transient_failure_slows_down_without_backoff() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let now = Instant::now();
        let phase = schedule.complete(&CycleOutcome::Transient, now);
        assert_eq!(phase, Phase::Waiting { until: now + Duration::from_secs(30) });
        assert_eq!(schedule.consecutive_quota_failures(), 0);
        assert!(!schedule.is_rate_limited());
    }

    #[test]
    fn early_wake_rechecks() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let now = Instant::now();
        schedule.complete(&CycleOutcome::QuotaExceeded, now);

        let early = now + Duration::from_secs(4);
        assert_eq!(
            schedule.on_wake(early),
            Readiness::Recheck { until: early + Duration::from_secs(1) }
        );
        assert_eq!(schedule.on_wake(now + Duration::from_secs(10)), Readiness::Run);
    }

    #[test]
    fn manual_override_clears_backoff() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let now = Instant::now();
        schedule.complete(&CycleOutcome::QuotaExceeded, now);
        schedule.on_wake(now + Duration::from_secs(10));
        schedule.complete(&CycleOutcome::QuotaExceeded, now + Duration::from_secs(10));

        let later = now + Duration::from_secs(12);
        schedule.manual_override(later);
        assert_eq!(schedule.consecutive_quota_failures(), 0);
        assert_eq!(schedule.next_eligible_at(), None);
        assert_eq!(schedule.phase(), Phase::Waiting { until: later });
        assert_eq!(schedule.on_wake(later), Readiness::Run);
    }

    #[test]
    fn next_eligible_never_moves_backwards() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let now = Instant::now();
        schedule.complete(&CycleOutcome::QuotaExceeded, now);
        schedule.complete(&CycleOutcome::QuotaExceeded, now);
        let eligible = schedule.next_eligible_at().unwrap();
        schedule.complete(&CycleOutcome::Transient, now);
        schedule.complete(&CycleOutcome::NoFrame, now);
        assert_eq!(schedule.next_eligible_at(), Some(eligible));
    }

    #[test]
    fn security_restriction_leaves_backoff_alone() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let now = Instant::now();
        schedule.complete(&CycleOutcome::QuotaExceeded, now);
        let eligible = schedule.next_eligible_at();

        schedule.complete(&CycleOutcome::SecurityRestriction("cannot read".into()), now);
        assert_eq!(schedule.consecutive_quota_failures(), 1);
        assert_eq!(schedule.next_eligible_at(), eligible);
        assert_eq!(schedule.banner(), Some("cannot read"));
    }

    #[test]
    fn configuration_error_stops() {
        let mut schedule = Schedule::new(policy());
        schedule.start();
        let phase = schedule.complete(&CycleOutcome::Configuration("no key".into()), Instant::now());
        assert_eq!(phase, Phase::Stopped);
        assert_eq!(schedule.banner(), Some("no key"));
    }

    pub(crate) fn frame() -> EncodedFrame {
        EncodedFrame {
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 2,
            height: 2,
            captured_at: Local::now(),
        }
    }

    pub(crate) fn success(vehicle_count: u32, congestion_level: CongestionLevel) -> AnalysisResult {
        AnalysisResult {
            vehicle_count,
            congestion_level,
            description: "test".into(),
            detected_objects: vec![],
            timestamp: "00:00:00".into(),
            processed_at: 0,
        }
    }

    pub(crate) struct StaticCapture(pub Result<Option<EncodedFrame>, CaptureError>);

    impl Capture for StaticCapture {
        async fn capture(&self) -> Result<Option<EncodedFrame>, CaptureError> {
            self.0.clone()
        }
    }

    /// Answers from a script, then hangs. Records when each call started.
    #[derive(Default)]
    pub(crate) struct ScriptedAnalyzer {
        pub script: StdMutex<VecDeque<Result<AnalysisResult, AnalyzeError>>>,
        pub calls: StdMutex<Vec<Instant>>,
        pub latency: Duration,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl ScriptedAnalyzer {
        pub fn new(script: Vec<Result<AnalysisResult, AnalyzeError>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                ..Default::default()
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn call_gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Analyze for ScriptedAnalyzer {
        async fn analyze(&self, _frame: EncodedFrame) -> Result<AnalysisResult, AnalyzeError> {
            self.calls.lock().unwrap().push(Instant::now());
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let result = match next {
                Some(result) => result,
                None => std::future::pending().await,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Harness {
        analyzer: Arc<ScriptedAnalyzer>,
        board: Arc<RwLock<Board>>,
        status: watch::Receiver<ScheduleStatus>,
        handle: SchedulerHandle,
    }

    fn spawn(capture: StaticCapture, analyzer: ScriptedAnalyzer) -> Harness {
        let analyzer = Arc::new(analyzer);
        let board = Arc::new(RwLock::new(Board::default()));
        let (status_tx, status) = watch::channel(ScheduleStatus::default());
        let handle = Scheduler::new(
            Arc::new(capture),
            analyzer.clone(),
            board.clone(),
            policy(),
            Arc::new(status_tx),
        )
        .spawn();
        Harness {
            analyzer,
            board,
            status,
            handle,
        }
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff <= Duration::from_millis(5),
            "expected about {expected:?}, got {actual:?}"
        );
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    async fn advance_ms(millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_cycle_lands_in_history() {
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![Ok(success(5, CongestionLevel::Medium))]),
        );
        advance(1).await;

        {
            let board = h.board.read().await;
            assert_eq!(board.history().len(), 1);
            let latest = board.history().latest().unwrap();
            assert_eq!(latest.vehicle_count, 5);
            assert_eq!(latest.congestion_level, CongestionLevel::Medium);
        }
        let status = h.status.borrow().clone();
        assert!(!status.is_rate_limited);
        assert_eq!(status.phase, PhaseKind::Waiting);
        assert_eq!(status.consecutive_quota_failures, 0);
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failures_back_off_exponentially() {
        let quota = || Err(AnalyzeError::QuotaExceeded("429 Too Many Requests".into()));
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![quota(), quota(), quota()]),
        );

        advance(5).await;
        assert!(h.status.borrow().is_rate_limited);
        advance_ms(45_500).await;
        // Third backoff (40s) started at 30s, the last tick was at 50s.
        let status = h.status.borrow().clone();
        assert!(status.is_rate_limited);
        assert_eq!(status.consecutive_quota_failures, 3);
        assert_eq!(status.retry_countdown_secs, 20);

        advance(30).await;
        assert_eq!(h.analyzer.call_count(), 4);
        let gaps = h.analyzer.call_gaps();
        for (gap, secs) in gaps.into_iter().zip([10, 20, 40]) {
            assert_close(gap, Duration::from_secs(secs));
        }
        assert!(h.status.borrow().is_rate_limited);
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_waits_one_and_a_half_intervals() {
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![
                Err(AnalyzeError::Transient("socket closed".into())),
                Ok(success(1, CongestionLevel::Low)),
            ]),
        );

        advance(1).await;
        let status = h.status.borrow().clone();
        assert_eq!(status.consecutive_quota_failures, 0);
        assert!(!status.is_rate_limited);

        advance(50).await;
        assert_eq!(h.analyzer.call_count(), 3);
        assert_close(h.analyzer.call_gaps()[0], Duration::from_secs(30));
        assert_close(h.analyzer.call_gaps()[1], Duration::from_secs(20));
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_retries_immediately() {
        let quota = || Err(AnalyzeError::QuotaExceeded("RESOURCE_EXHAUSTED".into()));
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![quota(), quota(), Ok(success(2, CongestionLevel::Low))]),
        );

        // Calls at 0s and 10s, the second failure backs off until 30s.
        advance(15).await;
        assert_eq!(h.analyzer.call_count(), 2);
        assert!(h.status.borrow().is_rate_limited);

        h.handle.manual_override();
        advance(1).await;
        assert_eq!(h.analyzer.call_count(), 3);
        assert_close(h.analyzer.call_gaps()[1], Duration::from_secs(5));

        let status = h.status.borrow().clone();
        assert_eq!(status.consecutive_quota_failures, 0);
        assert!(!status.is_rate_limited);
        assert_eq!(h.board.read().await.history().len(), 1);
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_call_in_flight() {
        let script = (0..20)
            .map(|i| Ok(success(i, CongestionLevel::Low)))
            .collect();
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(script).with_latency(Duration::from_secs(7)),
        );

        advance(200).await;
        assert!(h.analyzer.call_count() > 3);
        assert_eq!(h.analyzer.max_in_flight.load(Ordering::SeqCst), 1);
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn security_restriction_is_surfaced_without_backoff() {
        let h = spawn(
            StaticCapture(Err(CaptureError::SecurityRestriction)),
            ScriptedAnalyzer::new(vec![]),
        );

        advance(1).await;
        let status = h.status.borrow().clone();
        assert!(status.banner.unwrap().contains("cross-origin"));
        assert_eq!(status.consecutive_quota_failures, 0);
        assert!(!status.is_rate_limited);
        assert_eq!(status.next_cycle_in_ms, Some(20_000));
        assert_eq!(h.analyzer.call_count(), 0);
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_error_stops_the_loop() {
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![Err(AnalyzeError::Configuration("no API key".into()))]),
        );

        advance(1).await;
        assert!(h.handle.is_finished());
        let status = h.status.borrow().clone();
        assert_eq!(status.phase, PhaseKind::Stopped);
        assert!(status.banner.unwrap().contains("no API key"));
        h.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_the_in_flight_result() {
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![Ok(success(9, CongestionLevel::High))])
                .with_latency(Duration::from_secs(10)),
        );

        advance(1).await;
        assert_eq!(h.status.borrow().in_flight, 1);
        h.handle.stop().await;
        advance(30).await;

        assert!(h.board.read().await.history().is_empty());
        let status = h.status.borrow().clone();
        assert_eq!(status.phase, PhaseKind::Stopped);
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_waiting_for_the_board_discards_the_result() {
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![Ok(success(4, CongestionLevel::Medium))]),
        );
        let reader = h.board.clone().read_owned().await;

        advance_ms(10).await;
        assert_eq!(h.analyzer.call_count(), 1);
        let stopping = tokio::spawn(h.handle.stop());
        advance_ms(10).await;
        drop(reader);
        stopping.await.unwrap();

        let board = h.board.read().await;
        assert!(board.history().is_empty());
        assert!(board.detections().is_empty());
        assert_eq!(h.status.borrow().phase, PhaseKind::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_is_ignored_when_not_rate_limited() {
        let h = spawn(
            StaticCapture(Ok(Some(frame()))),
            ScriptedAnalyzer::new(vec![
                Ok(success(1, CongestionLevel::Low)),
                Ok(success(2, CongestionLevel::Low)),
            ]),
        );

        advance(1).await;
        h.handle.manual_override();
        advance(10).await;
        assert_eq!(h.analyzer.call_count(), 1);

        advance(10).await;
        assert_eq!(h.analyzer.call_count(), 2);
        assert_close(h.analyzer.call_gaps()[0], Duration::from_secs(20));
        h.handle.stop().await;
    }
}
