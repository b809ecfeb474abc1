//! Scoped wall-clock measurement.
//!
//! A [`ScopedTimer`] reports how long its scope ran when it is dropped, including when the
//! scope unwinds from a panic.

use std::fmt;
use std::time::{Duration, Instant};

/// How the timed scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingReport {
    pub label: String,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            Outcome::Completed => write!(f, "{} took {:?}", self.label, self.elapsed),
            Outcome::Panicked => write!(f, "{} panicked after {:?}", self.label, self.elapsed),
        }
    }
}

type Sink = Box<dyn FnMut(&TimingReport) + Send>;

/// Drop guard that logs a [`TimingReport`] and optionally hands it to a sink.
pub struct ScopedTimer {
    label: String,
    start: Instant,
    level: log::Level,
    sink: Option<Sink>,
}

impl ScopedTimer {
    pub fn new(label: impl Into<String>) -> Self {
        ScopedTimer {
            label: label.into(),
            start: Instant::now(),
            level: log::Level::Info,
            sink: None,
        }
    }

    pub fn with_level(mut self, level: log::Level) -> Self {
        self.level = level;
        self
    }

    /// Also delivers the report to `sink` when the timer drops.
    pub fn with_sink(mut self, sink: impl FnMut(&TimingReport) + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let report = TimingReport {
            label: std::mem::take(&mut self.label),
            elapsed: self.start.elapsed(),
            outcome: if std::thread::panicking() {
                Outcome::Panicked
            } else {
                Outcome::Completed
            },
        };
        log::log!(self.level, "{report}");
        if let Some(sink) = self.sink.as_mut() {
            sink(&report);
        }
    }
}

/// Runs `f` and returns its result with the elapsed time.
pub fn measure<R>(label: &str, f: impl FnOnce() -> R) -> (R, Duration) {
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed();
    log::debug!("{label} took {elapsed:?}");
    (result, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn reports_completion_to_the_sink() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        {
            let reports = Arc::clone(&reports);
            let _timer = ScopedTimer::new("work")
                .with_sink(move |report| reports.lock().unwrap().push(report.clone()));
        }
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].label, "work");
        assert_eq!(reports[0].outcome, Outcome::Completed);
    }

    #[test]
    fn measure_returns_the_result() {
        let (value, elapsed) = measure("sum", || (1..=10).sum::<u32>());
        assert_eq!(value, 55);
        assert!(elapsed <= Duration::from_secs(5));
    }
}
