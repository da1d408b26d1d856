#[cfg(test)]
mod tests {
    use promise_pool::{
        pool::{Config, PoolManager},
        promise::Promise,
        task::{Priority, Task},
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    fn measure<F, T>(name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        println!("✓ {}: {:?}", name, elapsed);
        result
    }

    #[test]
    fn load_test_1_small_fast_tasks() {
        println!("\n=== LOAD TEST 1: 10k быстрых задач ===");
        let pool = PoolManager::with_config(Config::io_bound()).unwrap();

        let results = measure("10k tasks", || {
            let promises: Vec<_> = (0..10_000u64)
                .map(|i| {
                    let task: Task<u64> = Task::new(move |_| Ok(i * 2));
                    pool.submit(&task).unwrap()
                })
                .collect();
            pool.all_of(promises).get_result().unwrap()
        });

        assert_eq!(results.len(), 10_000);
        assert_eq!(results[4_321], 8_642);
        let metrics = pool.metrics();
        println!("  Успешно: {}/{}", metrics.completed, metrics.submitted);
        println!("  Success rate: {:.1}%", metrics.success_rate() * 100.0);
        pool.shutdown();
    }

    #[test]
    fn load_test_2_blocking_io() {
        println!("\n=== LOAD TEST 2: 200 задач с блокирующим ожиданием ===");
        let pool = PoolManager::with_config(Config {
            max_workers: 32,
            ..Config::io_bound()
        })
        .unwrap();

        let elapsed = measure("200 tasks @ 10ms", || {
            let start = Instant::now();
            let promises: Vec<_> = (0..200u32)
                .map(|i| {
                    let task: Task<u32> = Task::new(move |ctx| {
                        ctx.sleep(Duration::from_millis(10))?;
                        Ok(i)
                    });
                    pool.submit(&task).unwrap()
                })
                .collect();
            let all = pool.all_of(promises).get_result().unwrap();
            assert_eq!(all.len(), 200);
            start.elapsed()
        });

        // последовательно было бы 2 секунды
        assert!(elapsed < Duration::from_secs(2), "no parallelism: {elapsed:?}");
        println!("  Воркеров: {}", pool.state().worker_count());
        pool.shutdown();
    }

    #[test]
    fn load_test_3_mixed_priorities() {
        println!("\n=== LOAD TEST 3: смешанные приоритеты ===");
        let pool = PoolManager::with_config(Config::cpu_bound()).unwrap();
        let priorities = [
            Priority::LOWEST,
            Priority::LOW,
            Priority::NORMAL,
            Priority::HIGH,
            Priority::REAL_TIME,
        ];

        let promises: Vec<_> = (0..1_000usize)
            .map(|i| {
                let task: Task<usize> = Task::builder(move |_| Ok(i))
                    .priority(priorities[i % priorities.len()])
                    .build();
                pool.submit(&task).unwrap()
            })
            .collect();
        let results = measure("1k mixed tasks", || pool.after_all(promises).get_result().unwrap());

        assert_eq!(results.len(), 1_000);
        assert!(results.iter().all(|outcome| outcome.state().is_terminal()));
        pool.shutdown();
    }

    #[test]
    fn load_test_4_parallel_pipeline() {
        println!("\n=== LOAD TEST 4: параллельный конвейер на 100k элементов ===");
        let pool = PoolManager::with_config(Config::cpu_bound()).unwrap();
        let visited = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&visited);
        let source: Promise<Vec<u64>> = pool.of((0..100_000).collect());
        let sum: u64 = measure("filter -> map -> for_each", || {
            source
                .stream()
                .filter_parallel(|x| x % 3 == 0)
                .map_parallel(|x| x / 3)
                .for_each(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                })
                .get_result()
                .unwrap()
                .into_iter()
                .sum()
        });

        assert_eq!(visited.load(Ordering::Relaxed), 33_334);
        assert_eq!(sum, (0..33_334u64).sum::<u64>());
        pool.shutdown();
    }

    #[test]
    fn load_test_5_cancellation_storm() {
        println!("\n=== LOAD TEST 5: массовая отмена ===");
        let pool = PoolManager::with_config(Config {
            max_workers: 2,
            ..Config::default()
        })
        .unwrap();

        let promises: Vec<_> = (0..2_000u32)
            .map(|i| {
                let task: Task<u32> = Task::new(move |ctx| {
                    ctx.checkpoint()?;
                    Ok(i)
                });
                pool.submit(&task).unwrap()
            })
            .collect();
        measure("cancel every other task", || {
            for promise in promises.iter().step_by(2) {
                let _ = promise.cancel(false);
            }
        });

        // a task may finish before its cancel arrives
        assert!(promises.iter().step_by(2).all(Promise::is_completed));
        let survivors: Vec<_> = promises.into_iter().skip(1).step_by(2).collect();
        let values = pool.all_of(survivors).get_result().unwrap();
        assert_eq!(values, (1..2_000u32).step_by(2).collect::<Vec<_>>());
        pool.shutdown();
    }
}
