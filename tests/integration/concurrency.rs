//! Concurrency primitives working together
//!
//! Channels feeding actors, select over several channels, and a task tree
//! cancelling coroutines and tasks.

use parking_lot::Mutex;
use skyrt::runtime::actor::Actor;
use skyrt::runtime::cancel::{TaskTree, ROOT_ID};
use skyrt::runtime::channel::{Channel, Select};
use skyrt::runtime::coroutine::Coroutine;
use skyrt::runtime::errors::TaskError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_channel_pipeline_into_actor() {
    let input: Channel<u32> = Channel::new(4);
    let total = Arc::new(Mutex::new(0u32));
    let actor = {
        let total = total.clone();
        Actor::new("summer", 8, move |n: u32| *total.lock() += n)
    };
    actor.start().unwrap();

    let producer = {
        let input = input.clone();
        thread::spawn(move || {
            for n in 1..=100 {
                input.send(n).unwrap();
            }
            input.close();
        })
    };
    for n in input.iter() {
        actor.send(n).unwrap();
    }
    producer.join().unwrap();
    actor.stop();
    actor.join();

    assert_eq!(*total.lock(), 5050);
    assert_eq!(actor.processed(), 100);
}

#[test]
fn test_select_drains_both_channels() {
    let numbers: Channel<i32> = Channel::new(8);
    let words: Channel<&str> = Channel::new(8);
    for n in 0..3 {
        numbers.send(n).unwrap();
    }
    words.send("a").unwrap();
    words.send("b").unwrap();

    let seen = Mutex::new(Vec::new());
    loop {
        let mut select = Select::new()
            .recv(&numbers, |n| {
                seen.lock().push(n.to_string());
                Ok(())
            })
            .recv(&words, |w| {
                seen.lock().push(w.to_string());
                Ok(())
            });
        if select.execute().unwrap().is_none() {
            break;
        }
    }
    // The first ready case wins, so numbers drain before words.
    assert_eq!(*seen.lock(), vec!["0", "1", "2", "a", "b"]);
}

#[test]
fn test_task_tree_cancels_coroutine_subtree() {
    let tree = TaskTree::new();
    let job = tree.add_task("job", ROOT_ID);
    let reader = tree.add_task("reader", "job");

    let co = Coroutine::new(move |y, _| {
        let mut n = 0u64;
        loop {
            if reader.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            y.yield_value(n)?;
            n += 1;
            thread::sleep(Duration::from_millis(1));
        }
    })
    .unwrap();

    while co.buffered() < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(tree.cancel_task("job"));
    assert!(job.is_cancelled());
    assert_eq!(co.wait(), Err(TaskError::Cancelled));
    assert!(!tree.root().is_cancelled());
}
