//! Compiled, time-stepped command list.

use std::time::Duration;

/// Output of the script compiler: a fixed interval and the commands to send
/// at each step.
///
/// Step `i` is due `i * interval` after the run starts. A step may be empty.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSchedule {
    interval: f64,
    steps: Vec<Vec<String>>,
}

impl CommandSchedule {
    /// Build a schedule from an interval in seconds and its steps.
    pub fn new(interval: f64, steps: Vec<Vec<String>>) -> Self {
        Self { interval, steps }
    }

    /// Step interval in seconds.
    pub fn interval_secs(&self) -> f64 {
        self.interval
    }

    /// Step interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// All steps in order.
    pub fn steps(&self) -> &[Vec<String>] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Total number of commands across all steps.
    pub fn command_count(&self) -> usize {
        self.steps.iter().map(Vec::len).sum()
    }

    /// Nominal run time: one interval per step.
    pub fn duration(&self) -> Duration {
        self.interval().mul_f64(self.steps.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_duration() {
        let schedule = CommandSchedule::new(
            0.5,
            vec![vec![], vec!["A:x()".into(), "B:y()".into()], vec!["A:z()".into()]],
        );
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.command_count(), 3);
        assert_eq!(schedule.interval(), Duration::from_millis(500));
        assert_eq!(schedule.duration(), Duration::from_millis(1500));
    }
}
