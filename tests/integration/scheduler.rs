//! Scheduler end-to-end tests
//!
//! Tasks dispatched through a running scheduler, observed from the outside.

use parking_lot::Mutex;
use skyrt::runtime::errors::TaskError;
use skyrt::runtime::scheduler::{Scheduler, Task, TaskState};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn recording_task(
    name: &str,
    order: &Arc<Mutex<Vec<String>>>,
) -> Task<()> {
    let order = order.clone();
    let label = name.to_string();
    Task::named(name, move |_| {
        order.lock().push(label);
        Ok(())
    })
}

#[test]
fn test_dispatch_follows_deadline_then_priority() {
    let scheduler = Scheduler::with_workers(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now() + Duration::from_millis(20);

    let late = recording_task("late", &order);
    let early_low = recording_task("early-low", &order);
    let early_high = recording_task("early-high", &order);
    scheduler
        .schedule_at(&late, 1, base + Duration::from_millis(20))
        .unwrap();
    scheduler.schedule_at(&early_low, 1, base).unwrap();
    scheduler.schedule_at(&early_high, 5, base).unwrap();
    scheduler.start().unwrap();

    for task in [&late, &early_low, &early_high] {
        task.await_result().unwrap();
    }
    assert!(Instant::now() >= base + Duration::from_millis(20));
    assert_eq!(*order.lock(), vec!["early-high", "early-low", "late"]);
    scheduler.stop();
}

#[test]
fn test_results_flow_through_continuations() {
    let scheduler = Scheduler::with_workers(2);
    scheduler.start().unwrap();

    let source = Task::new(|_| Ok(20));
    let doubled = source.then(|v| Ok(v * 2)).then(|v| Ok(v + 2));
    scheduler
        .schedule_delayed(&source, Duration::from_millis(5))
        .unwrap();
    assert_eq!(doubled.await_result(), Ok(42));
    scheduler.stop();
}

#[test]
fn test_stop_cancels_far_deadlines() {
    let scheduler = Scheduler::with_workers(1);
    scheduler.start().unwrap();
    let far = Task::new(|_| Ok(1));
    scheduler
        .schedule_delayed(&far, Duration::from_secs(60))
        .unwrap();
    scheduler.stop();
    assert_eq!(far.state(), TaskState::Cancelled);
    assert_eq!(far.await_result(), Err(TaskError::Cancelled));
}
