use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the epoch, for absolute deadlines.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Server-side query phases with per-phase timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryPhase {
    SchedulerWait,
    QueryProcessing,
    SegmentPruning,
    BuildQueryPlan,
    QueryPlanExecution,
}

impl QueryPhase {
    /// Name used in trace output.
    pub fn as_str(self) -> &'static str {
        match self {
            QueryPhase::SchedulerWait => "SCHEDULER_WAIT",
            QueryPhase::QueryProcessing => "QUERY_PROCESSING",
            QueryPhase::SegmentPruning => "SEGMENT_PRUNING",
            QueryPhase::BuildQueryPlan => "BUILD_QUERY_PLAN",
            QueryPhase::QueryPlanExecution => "QUERY_PLAN_EXECUTION",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseTimer {
    started: Instant,
    recorded: Option<Duration>,
}

/// Monotonic per-query phase timers.
///
/// The scheduler-wait timer starts at construction; each later phase is
/// started and stopped explicitly by the executor pipeline.
#[derive(Debug)]
pub struct TimerContext {
    query_arrival_time_ms: u64,
    timers: HashMap<QueryPhase, PhaseTimer>,
}

impl TimerContext {
    /// Starts timing at request arrival.
    pub fn new(query_arrival_time_ms: u64) -> Self {
        let mut timers = HashMap::new();
        timers.insert(
            QueryPhase::SchedulerWait,
            PhaseTimer {
                started: Instant::now(),
                recorded: None,
            },
        );
        Self {
            query_arrival_time_ms,
            timers,
        }
    }

    /// Request arrival time in epoch milliseconds.
    pub fn query_arrival_time_ms(&self) -> u64 {
        self.query_arrival_time_ms
    }

    /// Starts (or restarts) the timer for a phase.
    pub fn start(&mut self, phase: QueryPhase) {
        self.timers.insert(
            phase,
            PhaseTimer {
                started: Instant::now(),
                recorded: None,
            },
        );
    }

    /// Stops a running phase timer and records its duration.
    pub fn stop_and_record(&mut self, phase: QueryPhase) -> Option<Duration> {
        let timer = self.timers.get_mut(&phase)?;
        if timer.recorded.is_none() {
            timer.recorded = Some(timer.started.elapsed());
        }
        timer.recorded
    }

    /// Recorded duration of a stopped phase, in milliseconds.
    pub fn duration_ms(&self, phase: QueryPhase) -> Option<u64> {
        self.timers
            .get(&phase)
            .and_then(|timer| timer.recorded)
            .map(|d| d.as_millis() as u64)
    }

    /// All recorded phases in a stable order, for trace output.
    pub fn recorded_phases(&self) -> Vec<(QueryPhase, u64)> {
        let mut phases: Vec<_> = self
            .timers
            .iter()
            .filter_map(|(phase, timer)| {
                timer.recorded.map(|d| (*phase, d.as_millis() as u64))
            })
            .collect();
        phases.sort_by_key(|(phase, _)| phase.as_str());
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_each_phase_once() {
        let mut timers = TimerContext::new(current_time_ms());
        timers.stop_and_record(QueryPhase::SchedulerWait);
        timers.start(QueryPhase::SegmentPruning);
        std::thread::sleep(Duration::from_millis(2));
        timers.stop_and_record(QueryPhase::SegmentPruning);

        assert!(timers.duration_ms(QueryPhase::SchedulerWait).is_some());
        assert!(timers.duration_ms(QueryPhase::SegmentPruning).unwrap() >= 2);
        assert!(timers.duration_ms(QueryPhase::BuildQueryPlan).is_none());
    }

    #[test]
    fn second_stop_keeps_first_recording() {
        let mut timers = TimerContext::new(0);
        timers.start(QueryPhase::QueryProcessing);
        let first = timers.stop_and_record(QueryPhase::QueryProcessing);
        std::thread::sleep(Duration::from_millis(2));
        let second = timers.stop_and_record(QueryPhase::QueryProcessing);
        assert_eq!(first, second);
    }
}
