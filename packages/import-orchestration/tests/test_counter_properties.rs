//! Property tests for waiter counters

use import_orchestration::{CounterStore, MemoryStore, WaiterKey};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    /// Decrement the counter under test
    Decrement,
    /// Decrement a key nobody created
    Stray,
    /// Read without changing anything
    Read,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Decrement),
        1 => Just(Op::Stray),
        1 => Just(Op::Read),
    ]
}

proptest! {
    #[test]
    fn remaining_is_monotonic_and_never_negative(
        initial in 0u64..50,
        ops in proptest::collection::vec(op(), 0..120),
    ) {
        tokio_test::block_on(async {
            let store = MemoryStore::default();
            let key = store.create(initial).await.unwrap();
            let stray = WaiterKey::new("import:waiter:stray");

            let mut previous = store.remaining(&key).await.unwrap();
            prop_assert_eq!(previous, initial);
            let mut decrements = 0u64;

            for op in &ops {
                match op {
                    Op::Decrement => {
                        store.decrement(&key).await.unwrap();
                        decrements += 1;
                    }
                    Op::Stray => store.decrement(&stray).await.unwrap(),
                    Op::Read => {}
                }

                let current = store.remaining(&key).await.unwrap();
                prop_assert!(current <= previous);
                previous = current;
            }

            prop_assert_eq!(previous, initial.saturating_sub(decrements));
            prop_assert_eq!(store.remaining(&stray).await.unwrap(), 0);
            Ok(())
        })?;
    }

    #[test]
    fn concurrent_duplicate_signals_settle_at_zero(
        jobs in 1u64..30,
        duplicates in 0usize..10,
        threads in 2usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = MemoryStore::default();
            let key = store.create(jobs).await.unwrap();

            // Reads concurrently with the signals; the count may only go down
            let reader = {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let mut previous = u64::MAX;
                    loop {
                        let current = store.remaining(&key).await.unwrap();
                        if current > previous {
                            return false;
                        }
                        if current == 0 {
                            return true;
                        }
                        previous = current;
                        tokio::task::yield_now().await;
                    }
                })
            };

            let signals: Vec<_> = (0..(jobs as usize + duplicates))
                .map(|_| {
                    let store = store.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        store.decrement(&key).await
                    })
                })
                .collect();
            for signal in futures::future::join_all(signals).await {
                signal.unwrap().unwrap();
            }

            prop_assert!(reader.await.unwrap());
            prop_assert_eq!(store.remaining(&key).await.unwrap(), 0);
            Ok(())
        })?;
    }
}
