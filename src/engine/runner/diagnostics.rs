use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timings of the tasks executed by one scheduler run, in completion order.
#[derive(Debug, Default)]
pub struct Diagnostics {
    completed: Vec<(String, TaskExecution)>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, name: &str, execution: TaskExecution) {
        self.completed.push((name.to_string(), execution));
    }

    /// Names of the tasks that ran, in the order they finished.
    pub fn completed(&self) -> Vec<&str> {
        self.completed.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn total(&self) -> Duration {
        let first = self.completed.iter().map(|(_, e)| e.start).min();
        let last = self
            .completed
            .iter()
            .map(|(_, e)| e.start + e.duration)
            .max();

        match (first, last) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => Duration::ZERO,
        }
    }

    /// The slowest tasks first.
    pub fn slowest(&self, n: usize) -> Vec<(&str, Duration)> {
        let mut all: Vec<_> = self
            .completed
            .iter()
            .map(|(name, e)| (name.as_str(), e.duration))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1));
        all.truncate(n);
        all
    }

    pub(crate) fn log_summary(&self) {
        tracing::info!("finished {} task(s) in {:.2?}", self.completed.len(), self.total());
        for (name, duration) in self.slowest(3) {
            tracing::debug!(task = name, "took {duration:.2?}");
        }
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (name, execution) in &self.completed {
            writeln!(f, "{name:<24} {:>10.2?}", execution.duration)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slowest_first() {
        let start = Instant::now();
        let mut diagnostics = Diagnostics::default();
        diagnostics.record("styles", TaskExecution { start, duration: Duration::from_millis(5) });
        diagnostics.record("images", TaskExecution { start, duration: Duration::from_millis(50) });
        diagnostics.record("fonts", TaskExecution { start, duration: Duration::from_millis(1) });

        let slowest = diagnostics.slowest(2);
        assert_eq!(slowest[0].0, "images");
        assert_eq!(slowest[1].0, "styles");
        assert_eq!(diagnostics.total(), Duration::from_millis(50));
        assert_eq!(diagnostics.completed(), ["styles", "images", "fonts"]);
    }
}
