use crate::error::ConfigError;
use crate::types::{RunState, Stage};
use std::time::Duration;

/// Info about current stage for display purposes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageInfo {
    pub stage_index: usize,
    pub stage_count: usize,
    pub target: u32,
    pub current: u32,
    pub elapsed: Duration,
    pub stage_elapsed: Duration,
    pub stage_duration: Duration,
    pub state: RunState,
}

/// Piecewise-linear concurrency ramp. Each stage ramps from where the
/// previous one ended to its own target, so the curve never jumps at a
/// boundary unless a stage has zero duration.
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<Stage>,
    start_target: u32,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>, start_target: u32) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::InvalidStages(
                "at least one stage is required".to_string(),
            ));
        }
        let total: Duration = stages.iter().map(|s| s.duration).sum();
        if total.is_zero() {
            return Err(ConfigError::InvalidStages(
                "total stage duration must be greater than zero".to_string(),
            ));
        }
        if start_target == 0 && stages.iter().all(|s| s.target == 0) {
            return Err(ConfigError::InvalidStages(
                "every stage targets 0 virtual users".to_string(),
            ));
        }
        Ok(Self {
            stages,
            start_target,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Calculate total duration of all stages
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Fractional target at `elapsed`, or `None` once the plan is over.
    pub fn target_at(&self, elapsed: Duration) -> Option<f64> {
        self.locate(elapsed).map(|(_, _, target)| target)
    }

    /// Whole number of workers the pool should run at `elapsed`.
    pub fn workers_at(&self, elapsed: Duration) -> Option<u32> {
        self.target_at(elapsed).map(|t| t.round() as u32)
    }

    pub fn stage_info(&self, elapsed: Duration, current: u32) -> StageInfo {
        match self.locate(elapsed) {
            Some((index, stage_elapsed, target)) => StageInfo {
                stage_index: index,
                stage_count: self.stages.len(),
                target: target.round() as u32,
                current,
                elapsed,
                stage_elapsed,
                stage_duration: self.stages[index].duration,
                state: RunState::Running,
            },
            None => {
                let last = self.stages.len() - 1;
                StageInfo {
                    stage_index: last,
                    stage_count: self.stages.len(),
                    target: self.stages[last].target,
                    current,
                    elapsed,
                    stage_elapsed: self.stages[last].duration,
                    stage_duration: self.stages[last].duration,
                    state: RunState::Running,
                }
            }
        }
    }

    fn locate(&self, elapsed: Duration) -> Option<(usize, Duration, f64)> {
        let mut stage_start = Duration::ZERO;
        let mut from = self.start_target as f64;

        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            let to = stage.target as f64;

            if elapsed < stage_end {
                let into = elapsed.saturating_sub(stage_start);
                let progress = into.as_secs_f64() / stage.duration.as_secs_f64();
                return Some((index, into, from + (to - from) * progress));
            }

            stage_start = stage_end;
            from = to;
        }

        None
    }
}
