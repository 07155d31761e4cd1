//! EventLoop 单元测试
//!
//! 测试任务生命周期、续体、微任务、定时器、Promise 以及停止语义

use crate::runtime::errors::TaskError;
use crate::runtime::event_loop::{spawn, EventLoop, EventLoopConfig, LoopState, Promise};
use crate::runtime::scheduler::task::{Task, TaskState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

fn started(workers: usize) -> EventLoop {
    let event_loop = EventLoop::new(EventLoopConfig::with_workers(workers));
    event_loop.start().unwrap();
    event_loop
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_task_state_roundtrip() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(TaskState::from_u8(state.as_u8()), state);
        }
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert_eq!(TaskState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new(|_| Ok(1));
        let b = Task::new(|_| Ok(2));
        assert_ne!(a.id(), b.id());
        assert_eq!(format!("{}", a.id()), format!("Task({})", a.id().inner()));
        assert_eq!(a.name(), a.id().to_string());
        assert_eq!(Task::named("loader", |_| Ok(())).name(), "loader");
    }

    #[test]
    fn test_run_inline() {
        let task = Task::new(|_| Ok("done"));
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.try_result(), None);
        task.run();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.await_result(), Ok("done"));
        assert_eq!(task.result(), Ok("done"));
    }

    #[test]
    fn test_cancel_pending() {
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = ran.clone();
            Task::new(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        task.cancel();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.token().is_cancelled());
        assert_eq!(task.await_result(), Err(TaskError::Cancelled));
        task.run();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let task = Task::new(|_| Ok(3));
        task.run();
        task.cancel();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.await_result(), Ok(3));
        assert!(!task.token().is_cancelled());
    }

    #[test]
    fn test_cancel_running_unblocks_waiters() {
        let task = Task::new(|token| {
            token.wait();
            Ok(99)
        });
        let runner = {
            let task = task.clone();
            thread::spawn(move || task.run())
        };
        wait_for(|| task.state() == TaskState::Running);
        let waiter = {
            let task = task.clone();
            thread::spawn(move || task.await_result())
        };
        task.cancel();
        assert_eq!(waiter.join().unwrap(), Err(TaskError::Cancelled));
        runner.join().unwrap();
        // the late body result is discarded
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(task.await_result(), Err(TaskError::Cancelled));
    }

    #[test]
    fn test_panic_and_error_become_failed() {
        let panicking: Task<i32> = Task::new(|_| panic!("boom"));
        panicking.run();
        assert_eq!(panicking.state(), TaskState::Failed);
        assert_eq!(
            panicking.await_result(),
            Err(TaskError::Panicked("boom".to_string()))
        );

        let failing: Task<i32> = Task::new(|_| Err(TaskError::failed("bad input")));
        failing.run();
        assert_eq!(failing.state(), TaskState::Failed);
        assert_eq!(failing.await_result().unwrap_err().to_string(), "bad input");
    }

    #[test]
    fn test_wait_timeout() {
        let task: Task<()> = Task::new(|_| Ok(()));
        assert_eq!(task.wait_timeout(Duration::from_millis(5)), None);
        task.run();
        assert_eq!(task.wait_timeout(Duration::from_millis(5)), Some(Ok(())));
    }

    #[test]
    fn test_continuations_without_loop_run_inline() {
        let task = Task::new(|_| Ok(2));
        let child = task.then(|v| Ok(v * 10));
        let grandchild = child.then(|v| Ok(v + 1));
        assert_eq!(child.parent(), Some(task.id()));
        task.run();
        assert_eq!(grandchild.await_result(), Ok(21));
    }

    #[test]
    fn test_then_on_finished_task() {
        let task = Task::new(|_| Ok(5));
        task.run();
        assert_eq!(task.then(|v| Ok(v - 1)).await_result(), Ok(4));
    }
}

#[cfg(test)]
mod loop_tests {
    use super::*;

    #[test]
    fn test_schedule_before_start() {
        let event_loop = EventLoop::with_workers(1);
        assert_eq!(event_loop.state(), LoopState::Idle);
        let task = Task::new(|_| Ok(()));
        assert_eq!(event_loop.schedule(&task), Err(TaskError::NotRunning));
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[test]
    fn test_spawn_and_await() {
        let event_loop = started(2);
        let tasks: Vec<_> = (0..20)
            .map(|i| event_loop.spawn(move |_| Ok(i * 2)).unwrap())
            .collect();
        let sum: i32 = tasks.iter().map(|t| t.await_result().unwrap()).sum();
        assert_eq!(sum, (0..20).map(|i| i * 2).sum());
        event_loop.stop();
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let event_loop = started(1);
        let bad: Task<i32> = event_loop.spawn(|_| panic!("worker panic")).unwrap();
        assert!(matches!(bad.await_result(), Err(TaskError::Panicked(_))));
        let good = event_loop.spawn(|_| Ok(1)).unwrap();
        assert_eq!(good.await_result(), Ok(1));
        wait_for(|| event_loop.stats().tasks_failed == 1);
        event_loop.stop();
    }

    #[test]
    fn test_then_and_catch_on_loop() {
        let event_loop = started(2);
        let task = event_loop.spawn(|_| Ok(2)).unwrap();
        let chained = task.then(|v| Ok(v * 10)).then(|v| Ok(v + 1));
        assert_eq!(chained.await_result(), Ok(21));

        let called = Arc::new(AtomicUsize::new(0));
        let failing: Task<i32> = event_loop
            .spawn(|_| Err(TaskError::failed("nope")))
            .unwrap();
        let skipped = {
            let called = called.clone();
            failing.then(move |v| {
                called.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            })
        };
        let recovered = failing.catch(|err| {
            assert_eq!(err, TaskError::failed("nope"));
            -1
        });
        assert_eq!(skipped.await_result(), Err(TaskError::failed("nope")));
        assert_eq!(recovered.await_result(), Ok(-1));
        assert_eq!(called.load(Ordering::SeqCst), 0);
        wait_for(|| event_loop.stats().microtasks_queued >= 4);
        event_loop.stop();
    }

    #[test]
    fn test_catch_passes_values_through() {
        let event_loop = started(1);
        let task = event_loop.spawn(|_| Ok("fine")).unwrap();
        assert_eq!(task.catch(|_| "recovered").await_result(), Ok("fine"));
        event_loop.stop();
    }

    #[test]
    fn test_microtask() {
        let event_loop = started(1);
        let task = Task::new(|_| Ok(7));
        event_loop.schedule_microtask(&task).unwrap();
        assert_eq!(task.await_result(), Ok(7));
        assert_eq!(event_loop.stats().microtasks_queued, 1);
        event_loop.stop();
    }

    #[test]
    fn test_microtask_queued_before_start() {
        let event_loop = EventLoop::with_workers(1);
        let task = Task::new(|_| Ok(1));
        event_loop.schedule_microtask(&task).unwrap();
        assert_eq!(task.wait_timeout(Duration::from_millis(20)), None);
        event_loop.start().unwrap();
        assert_eq!(task.await_result(), Ok(1));
        event_loop.stop();
    }

    #[test]
    fn test_set_timeout_fires_once() {
        let event_loop = started(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let timer = {
            let hits = hits.clone();
            event_loop.set_timeout(
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(20),
            )
        };
        assert!(!timer.is_interval());
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
        wait_for(|| event_loop.pending_timers() == 0);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.fire_count(), 1);
        assert_eq!(event_loop.stats().timers_scheduled, 1);
        event_loop.stop();
    }

    #[test]
    fn test_set_interval_until_cancelled() {
        let event_loop = started(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = {
            let hits = hits.clone();
            event_loop.set_interval(
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(10),
            )
        };
        wait_for(|| hits.load(Ordering::SeqCst) >= 3);
        timer.cancel();
        assert!(timer.is_cancelled());
        let seen = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        // at most one firing was already queued when it was cancelled
        assert!(hits.load(Ordering::SeqCst) <= seen + 1);
        wait_for(|| event_loop.pending_timers() == 0);
        event_loop.stop();
    }

    #[test]
    fn test_timer_cancel_before_due() {
        let event_loop = started(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = {
            let hits = hits.clone();
            event_loop.set_timeout(
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(30),
            )
        };
        timer.cancel();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timer.fire_count(), 0);
        event_loop.stop();
    }

    #[test]
    fn test_stop_leaves_nothing_pending() {
        let event_loop = started(1);
        let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(0);
        let blocker = event_loop
            .spawn(move |_| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                Ok(0)
            })
            .unwrap();
        let queued: Vec<_> = (0..5).map(|i| event_loop.spawn(move |_| Ok(i)).unwrap()).collect();
        wait_for(|| blocker.state() == TaskState::Running);

        let stopper = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.stop())
        };
        wait_for(|| event_loop.state() == LoopState::Stopped);
        drop(gate_tx);
        stopper.join().unwrap();

        assert_eq!(blocker.await_result(), Ok(0));
        for task in &queued {
            assert!(task.state().is_terminal());
        }
        assert_eq!(event_loop.active_tasks(), 0);
    }

    #[test]
    fn test_after_stop() {
        let event_loop = started(1);
        event_loop.stop();
        event_loop.stop();
        assert_eq!(event_loop.state(), LoopState::Stopped);
        event_loop.start().unwrap();
        assert!(!event_loop.is_running());

        let task = Task::new(|_| Ok(()));
        assert_eq!(event_loop.schedule(&task), Err(TaskError::NotRunning));
        assert_eq!(event_loop.schedule_microtask(&task), Err(TaskError::Stopped));
        let timer = event_loop.set_timeout(|_| Ok(()), Duration::from_millis(1));
        assert!(timer.is_cancelled());
    }

    #[test]
    fn test_stats() {
        let event_loop = started(1);
        let ok = event_loop.spawn(|_| Ok(())).unwrap();
        let bad: Task<()> = event_loop.spawn(|_| Err(TaskError::failed("x"))).unwrap();
        ok.await_result().unwrap();
        bad.await_result().unwrap_err();
        wait_for(|| {
            let stats = event_loop.stats();
            stats.tasks_completed == 1 && stats.tasks_failed == 1
        });
        let stats = event_loop.stats();
        assert_eq!(stats.tasks_scheduled, 2);
        assert_eq!(stats.tasks_cancelled, 0);
        event_loop.stop();
    }
}

#[cfg(test)]
mod promise_tests {
    use super::*;

    #[test]
    fn test_resolve_and_reject() {
        let event_loop = started(4);
        let ok = Promise::new(&event_loop, |resolver| resolver.resolve(42)).unwrap();
        let err: Promise<i32> =
            Promise::new(&event_loop, |resolver| resolver.reject(TaskError::failed("rejected")))
                .unwrap();
        assert_eq!(ok.await_result(), Ok(42));
        assert_eq!(err.await_result(), Err(TaskError::failed("rejected")));
        event_loop.stop();
    }

    #[test]
    fn test_resolver_moved_to_another_thread() {
        let event_loop = started(2);
        let promise = Promise::new(&event_loop, |resolver| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                resolver.resolve("later");
            });
        })
        .unwrap();
        assert_eq!(promise.await_result(), Ok("later"));
        event_loop.stop();
    }

    #[test]
    fn test_abandoned_and_panicking_setup() {
        let event_loop = started(2);
        let abandoned: Promise<i32> = Promise::new(&event_loop, |_resolver| {}).unwrap();
        assert_eq!(abandoned.await_result(), Err(TaskError::Abandoned));

        let panicked: Promise<i32> = Promise::new(&event_loop, |_resolver| panic!("setup")).unwrap();
        assert_eq!(
            panicked.await_result(),
            Err(TaskError::Panicked("setup".to_string()))
        );
        event_loop.stop();
    }

    #[test]
    fn test_then_and_catch() {
        let event_loop = started(2);
        let promise = Promise::new(&event_loop, |r| r.resolve(3)).unwrap();
        assert_eq!(promise.then(|v| Ok(v * 3)).await_result(), Ok(9));

        let failed: Promise<i32> =
            Promise::new(&event_loop, |r| r.reject(TaskError::failed("e"))).unwrap();
        assert_eq!(failed.catch(|_| 0).await_result(), Ok(0));
        event_loop.stop();
    }

    #[test]
    fn test_all_in_argument_order() {
        let event_loop = started(4);
        let slow = Promise::new(&event_loop, |r| {
            thread::sleep(Duration::from_millis(30));
            r.resolve(1)
        })
        .unwrap();
        let fast = Promise::new(&event_loop, |r| r.resolve(2)).unwrap();
        let all = Promise::all(&event_loop, vec![slow, fast]).unwrap();
        assert_eq!(all.await_result(), Ok(vec![1, 2]));
        event_loop.stop();
    }

    #[test]
    fn test_all_reports_first_error_in_order() {
        let event_loop = started(4);
        let first: Promise<i32> = Promise::new(&event_loop, |r| {
            thread::sleep(Duration::from_millis(30));
            r.reject(TaskError::failed("first"))
        })
        .unwrap();
        let second: Promise<i32> =
            Promise::new(&event_loop, |r| r.reject(TaskError::failed("second"))).unwrap();
        let all = Promise::all(&event_loop, vec![first, second]).unwrap();
        assert_eq!(all.await_result(), Err(TaskError::failed("first")));
        event_loop.stop();
    }

    #[test]
    fn test_race_first_settled_wins() {
        let event_loop = started(4);
        let slow = Promise::new(&event_loop, |r| {
            thread::sleep(Duration::from_millis(200));
            r.resolve("slow")
        })
        .unwrap();
        let fast = Promise::new(&event_loop, |r| r.resolve("fast")).unwrap();
        let race = Promise::race(&event_loop, vec![slow, fast]).unwrap();
        assert_eq!(race.await_result(), Ok("fast"));
        event_loop.stop();
    }

    #[test]
    fn test_race_cancelled_first() {
        let event_loop = started(4);
        let never: Promise<i32> = Promise::new(&event_loop, |r| {
            thread::sleep(Duration::from_millis(100));
            drop(r);
        })
        .unwrap();
        let race = Promise::race(&event_loop, vec![never]).unwrap();
        race.cancel();
        assert_eq!(race.await_result(), Err(TaskError::Cancelled));
        assert_eq!(race.state(), TaskState::Cancelled);
        event_loop.stop();
    }

    #[test]
    fn test_race_of_nothing() {
        let event_loop = started(1);
        let race: Promise<i32> = Promise::race(&event_loop, Vec::new()).unwrap();
        assert_eq!(race.await_result(), Err(TaskError::Abandoned));
        event_loop.stop();
    }

    #[test]
    fn test_global_spawn() {
        let future = spawn(|_| Ok(6 * 7));
        assert_eq!(future.await_result(), Ok(42));
        assert!(crate::runtime::event_loop::global().is_running());
    }
}
