use std::panic;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndvem::timing::{measure, Outcome, ScopedTimer, TimingReport};

fn recording_timer(label: &str, reports: &Arc<Mutex<Vec<TimingReport>>>) -> ScopedTimer {
    let reports = Arc::clone(reports);
    ScopedTimer::new(label).with_sink(move |report| reports.lock().unwrap().push(report.clone()))
}

#[test]
fn panicking_scopes_are_still_reported() {
    let _ = env_logger::builder().is_test(true).try_init();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let _timer = recording_timer("doomed", &reports);
        panic!("boom");
    }));
    assert!(outcome.is_err());

    {
        let _timer = recording_timer("fine", &reports).with_level(log::Level::Debug);
        std::thread::sleep(Duration::from_millis(2));
    }

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].label, "doomed");
    assert_eq!(reports[0].outcome, Outcome::Panicked);
    assert!(reports[0].to_string().starts_with("doomed panicked after"));
    assert_eq!(reports[1].outcome, Outcome::Completed);
    assert!(reports[1].elapsed >= Duration::from_millis(2));
    assert!(reports[1].to_string().starts_with("fine took"));
}

#[test]
fn measure_wraps_array_work() {
    let (sum, elapsed) = measure("sum of squares", || (1..=4u64).map(|x| x * x).sum::<u64>());
    assert_eq!(sum, 30);
    assert!(elapsed < Duration::from_secs(10));
}
