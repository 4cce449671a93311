//! These tests are intended to ensure that a batch function is called the
//! correct number of times, with the correct keys, for different
//! configurations

use dataloader::{Fetched, LoadError, Loader, Scheduler};
use futures::executor;
use std::{
    io,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
};

fn stringify(keys: &[usize]) -> Result<Fetched<usize, String>, LoadError> {
    Ok(keys.iter().map(|key| key.to_string()).collect::<Vec<_>>().into())
}

/// Wrap a batch function so that it records every set of keys it's called
/// with.
fn recorded<F>(
    calls: &Arc<Mutex<Vec<Vec<usize>>>>,
    function: F,
) -> impl Fn(&[usize]) -> Result<Fetched<usize, String>, LoadError> + Send + Sync + 'static
where
    F: Fn(&[usize]) -> Result<Fetched<usize, String>, LoadError> + Send + Sync + 'static,
{
    let calls = calls.clone();
    move |keys: &[usize]| {
        calls.lock().unwrap().push(keys.to_vec());
        function(keys)
    }
}

#[test]
fn simple_test() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);

    assert_eq!(fut1.wait().unwrap(), "10");
    assert_eq!(fut2.wait().unwrap(), "20");
    assert_eq!(*calls.lock().unwrap(), [vec![10, 20]]);
}

#[test]
fn values_for_one_and_many() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader: Loader<usize, String> = Loader::new(
        &scheduler,
        recorded(&calls, |ids| {
            Ok(ids.iter().map(|id| format!("v{}", id)).collect::<Vec<_>>().into())
        }),
    );

    let one = loader.load(1);
    let many = loader.load_many(vec![1, 2]);

    assert_eq!(one.wait().unwrap(), "v1");
    assert_eq!(many.wait().unwrap(), ["v1", "v2"]);
    assert_eq!(*calls.lock().unwrap(), [vec![1, 2]]);
}

#[test]
fn nothing_runs_until_forced() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    let many = loader.load_many(vec![1, 2]);
    let three = loader.load(3);

    assert!(calls.lock().unwrap().is_empty());
    assert!(!many.is_settled());
    assert!(!three.is_settled());
    assert_eq!(scheduler.pending(), 1);

    scheduler.drain_pending();

    assert_eq!(*calls.lock().unwrap(), [vec![1, 2, 3]]);
    assert_eq!(many.peek().unwrap().unwrap(), ["1", "2"]);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn keys_are_passed_in_load_order() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    let values = loader.load_many(vec![5, 3, 9]);
    let more = loader.load_many(vec![1, 3, 5, 7]);

    assert_eq!(values.wait().unwrap(), ["5", "3", "9"]);
    assert_eq!(more.wait().unwrap(), ["1", "3", "5", "7"]);
    assert_eq!(*calls.lock().unwrap(), [vec![5, 3, 9, 1, 7]]);
}

#[test]
fn test_duplicate_keys() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    let fut1 = loader.load(10);
    let fut2 = loader.load(10);
    let fut3 = loader.load(10);
    let fut4 = loader.load(20);

    assert_eq!(fut1.wait().unwrap(), "10");
    assert_eq!(fut2.wait().unwrap(), "10");
    assert_eq!(fut3.wait().unwrap(), "10");
    assert_eq!(fut4.wait().unwrap(), "20");
    assert_eq!(*calls.lock().unwrap(), [vec![10, 20]]);
}

#[test]
fn cached_across_drains() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    for _ in 0..2 {
        let one = loader.load_many(vec![1, 2]);
        let two = loader.load_many(vec![2, 3]);

        assert_eq!(one.wait().unwrap(), ["1", "2"]);
        assert_eq!(two.wait().unwrap(), ["2", "3"]);
    }

    assert_eq!(*calls.lock().unwrap(), [vec![1, 2, 3]]);
}

#[test]
fn low_key_test() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::builder(recorded(&calls, stringify))
        .max_batch_size(NonZeroUsize::new(2).unwrap())
        .build(&scheduler);

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);

    // Reaching the limit dispatches immediately, without a drain, and the
    // batch is no longer pending.
    assert_eq!(*calls.lock().unwrap(), [vec![10, 20]]);
    assert_eq!(fut1.peek().unwrap().unwrap(), "10");
    assert_eq!(scheduler.pending(), 0);

    let fut3 = loader.load(30);
    assert_eq!(scheduler.pending(), 1);

    assert_eq!(fut2.wait().unwrap(), "20");
    assert_eq!(fut3.wait().unwrap(), "30");
    assert_eq!(*calls.lock().unwrap(), [vec![10, 20], vec![30]]);
}

#[test]
fn key_limit_of_one() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let calls = counter.clone();
    let loader = Loader::builder(move |keys: &[usize]| {
        calls.fetch_add(1, Ordering::SeqCst);
        stringify(keys)
    })
    .max_batch_size(NonZeroUsize::new(1).unwrap())
    .build(&scheduler);

    let values = loader.load_many(vec![1, 2, 3]);

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(values.peek().unwrap().unwrap(), ["1", "2", "3"]);
    assert_eq!(loader.max_batch_size(), NonZeroUsize::new(1));
}

#[test]
fn explicit_dispatch_runs_one_loader() {
    let scheduler = Scheduler::new();
    let first_calls = Arc::new(Mutex::new(Vec::new()));
    let second_calls = Arc::new(Mutex::new(Vec::new()));
    let first = Loader::new(&scheduler, recorded(&first_calls, stringify));
    let second = Loader::new(&scheduler, recorded(&second_calls, stringify));

    let a = first.load(1);
    let b = second.load(2);

    first.dispatch();

    assert_eq!(scheduler.pending(), 1);
    assert_eq!(a.peek().unwrap().unwrap(), "1");
    assert!(b.peek().is_none());
    assert!(second_calls.lock().unwrap().is_empty());

    // A dispatched batch is skipped by the drain.
    assert_eq!(b.wait().unwrap(), "2");
    assert_eq!(*first_calls.lock().unwrap(), [vec![1]]);
    assert_eq!(*second_calls.lock().unwrap(), [vec![2]]);

    // Nothing open, nothing to do.
    first.dispatch();
    assert_eq!(first_calls.lock().unwrap().len(), 1);
}

#[test]
fn schedulers_are_independent() {
    let scheduler1 = Scheduler::new();
    let scheduler2 = Scheduler::new();
    let loader1 = Loader::new(&scheduler1, stringify);
    let loader2 = Loader::new(&scheduler2, stringify);

    let one = loader1.load(1);
    let two = loader2.load(2);

    assert_eq!(one.wait().unwrap(), "1");
    assert!(!two.is_settled());
    assert_eq!(scheduler2.pending(), 1);

    assert_eq!(two.wait().unwrap(), "2");
}

#[test]
fn short_result_rejects_every_key() {
    let scheduler = Scheduler::new();
    let loader: Loader<usize, String> = Loader::new(&scheduler, |_keys: &[usize]| {
        Ok(vec![String::from("only one")].into())
    });

    let one = loader.load(1);
    let two = loader.load(2);

    for value in [one, two] {
        match value.wait() {
            Err(LoadError::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

#[test]
fn fetch_error_reaches_every_key() {
    let scheduler = Scheduler::new();
    let loader: Loader<usize, String> = Loader::new(&scheduler, |_keys: &[usize]| {
        Err(LoadError::fetch(io::Error::new(
            io::ErrorKind::Other,
            "database unavailable",
        )))
    });

    let many = loader.load_many(vec![1, 2]);
    let err = many.wait().unwrap_err();

    assert!(matches!(err, LoadError::Fetch(..)));
    assert!(err.to_string().contains("database unavailable"));
    assert!(matches!(loader.load(1).wait(), Err(LoadError::Fetch(..))));
}

#[test]
fn failing_batch_does_not_stop_others() {
    let scheduler = Scheduler::new();
    let failing: Loader<usize, String> =
        Loader::new(&scheduler, |_keys: &[usize]| Err(LoadError::fetch(std::fmt::Error)));
    let working = Loader::new(&scheduler, stringify);

    let good = working.load(1);
    let bad = failing.load(1);

    assert!(bad.wait().is_err());
    assert_eq!(good.peek().unwrap().unwrap(), "1");
}

#[test]
fn missing_inputs_are_rejected_up_front() {
    let scheduler = Scheduler::new();
    let loader = Loader::new(&scheduler, stringify);

    assert!(matches!(loader.try_load(None), Err(LoadError::InvalidKey)));
    assert!(matches!(
        loader.try_load_many(None::<Vec<Option<usize>>>),
        Err(LoadError::InvalidInput)
    ));
    assert!(matches!(
        loader.try_load_many(Some(vec![Some(1), None])),
        Err(LoadError::InvalidKey)
    ));

    // Nothing was queued by the failed calls.
    assert_eq!(scheduler.pending(), 0);

    assert_eq!(
        LoadError::InvalidKey.to_string(),
        "load must be called with a key, but got: None"
    );

    let values = loader.try_load_many(Some(vec![Some(1), Some(2)])).unwrap();
    assert_eq!(values.wait().unwrap(), ["1", "2"]);
    assert_eq!(loader.try_load(Some(3)).unwrap().wait().unwrap(), "3");
}

#[test]
fn block_on_drains_like_wait() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);

    assert_eq!(executor::block_on(fut1).unwrap(), "1");
    assert_eq!(executor::block_on(fut2).unwrap(), "2");
    assert_eq!(*calls.lock().unwrap(), [vec![1, 2]]);
}

/// Load keys from several threads into the same batch, and confirm that a
/// single batch call was made fulfilling all of them
#[test]
fn test_threaded() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let calls = counter.clone();
    let loader = Loader::new(&scheduler, move |keys: &[usize]| {
        calls.fetch_add(1, Ordering::SeqCst);
        stringify(keys)
    });

    let loaded = Barrier::new(4);
    let loader_ref = &loader;
    let loaded_ref = &loaded;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    let value = loader_ref.load(i);

                    // Everybody queues before anybody forces.
                    loaded_ref.wait();
                    value.wait().unwrap()
                })
            })
            .collect();

        let result: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        result
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// Load the same key from several threads at once, and confirm that the batch
/// function only ever sees it once
#[test]
fn test_threaded_same_key() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let loader = Loader::new(&scheduler, recorded(&calls, stringify));

    let loaded = Barrier::new(8);
    let loader_ref = &loader;
    let loaded_ref = &loaded;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..8)
            .map(move |_| {
                s.spawn(move |_s| {
                    // Everybody starts loading at the same moment.
                    loaded_ref.wait();
                    loader_ref.load(7).wait().unwrap()
                })
            })
            .collect();

        let result: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        result
    })
    .unwrap();

    assert!(result.iter().all(|value| value == "7"));
    assert_eq!(*calls.lock().unwrap(), [vec![7]]);
    assert_eq!(scheduler.pending(), 0);
}
