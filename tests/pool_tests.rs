#[cfg(test)]
mod tests {
    use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
    use promise_pool::{
        dispatch::{Affinity, Job, UiThread},
        errors::{PoolError, TaskError},
        model::{PoolState, QueueId, WorkerStatus},
        policy::{LinearWithRealTimePriority, PoolPolicy},
        pool::{Config, Pool, PoolControl, PoolManager},
        promise::PromiseState,
        task::{Priority, Task, TaskRef, TaskState},
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn single_worker() -> Pool {
        init_tracing();
        PoolManager::with_config(Config {
            max_workers: 1,
            thread_name: "single".into(),
            ..Config::default()
        })
        .unwrap()
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    /// Task that holds its worker until the gate is opened.
    struct Gate {
        started: Receiver<()>,
        release: Sender<()>,
    }

    impl Gate {
        fn new() -> (Task<()>, Gate) {
            let (started_tx, started) = bounded(1);
            let (release, release_rx) = bounded::<()>(1);
            let task = Task::void(move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            });
            (task, Gate { started, release })
        }

        fn wait_started(&self) {
            self.started
                .recv_timeout(Duration::from_secs(5))
                .expect("gate task never started");
        }

        fn open(self) {
            let _ = self.release.send(());
        }
    }

    fn hold_worker(pool: &Pool) -> Gate {
        let (task, gate) = Gate::new();
        pool.submit(&task).unwrap();
        gate.wait_started();
        gate
    }

    #[test]
    fn test_submit_and_wait() {
        init_tracing();
        let pool = PoolManager::new().unwrap();
        let task: Task<u64> = Task::new(|_| Ok(6 * 7));
        let promise = pool.submit(&task).unwrap();

        assert_eq!(promise.get_result(), Ok(42));
        assert_eq!(promise.task_id(), task.id());
        assert_eq!(task.state(), TaskState::Finished);
        pool.shutdown();
    }

    #[test]
    fn test_failure_and_panic_reject() {
        let pool = PoolManager::new().unwrap();
        let failing: Task<u64> = Task::new(|_| Err(TaskError::msg("bad input")));
        let parse: Task<u64> = Task::new(|_| Ok("x1".parse::<u64>()?));
        let panicking: Task<u64> = Task::new(|_| panic!("worker exploded"));

        assert_eq!(
            pool.submit(&failing).unwrap().get_result(),
            Err(TaskError::msg("bad input"))
        );
        assert!(matches!(
            pool.submit(&parse).unwrap().get_result(),
            Err(TaskError::Failure(_))
        ));
        assert_eq!(
            pool.submit(&panicking).unwrap().get_result(),
            Err(TaskError::Panic("worker exploded".into()))
        );

        // the pool keeps working after a panic
        let fine: Task<u64> = Task::new(|_| Ok(1));
        assert_eq!(pool.submit(&fine).unwrap().get_result(), Ok(1));
        pool.shutdown();
    }

    #[test]
    fn test_illegal_reuse_and_reset() {
        let pool = PoolManager::new().unwrap();
        let task: Task<u32> = Task::new(|_| Ok(5));

        let first = pool.submit(&task).unwrap();
        assert!(matches!(
            pool.submit(&task),
            Err(PoolError::IllegalReuse { .. })
        ));
        assert_eq!(first.get_result(), Ok(5));

        task.reset().unwrap();
        assert_eq!(task.state(), TaskState::Uninitialized);
        let second = pool.submit(&task).unwrap();
        assert_eq!(second.get_result(), Ok(5));
        assert!(!second.ptr_eq(&first));
        pool.shutdown();
    }

    #[test]
    fn test_priority_order_on_single_worker() {
        let pool = single_worker();
        let gate = hold_worker(&pool);

        let (tx, rx) = unbounded();
        let mut promises = Vec::new();
        for (label, priority) in [
            ("low", Priority::LOW),
            ("normal-1", Priority::NORMAL),
            ("high", Priority::HIGH),
            ("normal-2", Priority::NORMAL),
            ("lowest", Priority::LOWEST),
        ] {
            let tx = tx.clone();
            let task: Task<()> = Task::builder(move |_| {
                tx.send(label).unwrap();
                Ok(())
            })
            .priority(priority)
            .build();
            promises.push(pool.submit(&task).unwrap());
        }
        assert_eq!(pool.state().queued_tasks(), 5);

        gate.open();
        for promise in &promises {
            promise.get_result().unwrap();
        }
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec!["high", "normal-1", "normal-2", "low", "lowest"]
        );
        pool.shutdown();
    }

    #[test]
    fn test_real_time_task_bypasses_busy_worker() {
        let pool = single_worker();
        let gate = hold_worker(&pool);

        let task: Task<String> = Task::builder(|_| {
            Ok(thread::current().name().unwrap_or_default().to_string())
        })
        .priority(Priority::REAL_TIME)
        .build();
        let thread_name = pool
            .submit(&task)
            .unwrap()
            .get_result_timeout(Duration::from_secs(5))
            .unwrap();

        assert!(thread_name.contains("-rt-"), "ran on {thread_name}");
        assert_eq!(pool.state().queued_tasks(), 0);
        gate.open();
        pool.shutdown();
    }

    #[test]
    fn test_real_time_task_starts_before_earlier_normal_task() {
        let pool = single_worker();
        let gate = hold_worker(&pool);

        let normal: Task<Instant> = Task::new(|_| Ok(Instant::now()));
        let normal_promise = pool.submit(&normal).unwrap();
        assert_eq!(normal.state(), TaskState::Queued);

        let real_time: Task<Instant> = Task::builder(|_| Ok(Instant::now()))
            .priority(Priority::REAL_TIME)
            .build();
        let real_time_started = pool
            .submit(&real_time)
            .unwrap()
            .get_result_timeout(Duration::from_secs(5))
            .unwrap();

        gate.open();
        let normal_started = normal_promise
            .get_result_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(real_time_started < normal_started);
        pool.shutdown();
    }

    #[test]
    fn test_cancelled_queued_task_never_runs() {
        let pool = single_worker();
        let gate = hold_worker(&pool);

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let task: Task<u32> = Task::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        let promise = pool.submit(&task).unwrap();
        assert_eq!(task.state(), TaskState::Queued);

        promise.cancel(false).unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(pool.state().queued_tasks(), 0);

        gate.open();
        let after: Task<u32> = Task::new(|_| Ok(2));
        assert_eq!(pool.submit(&after).unwrap().get_result(), Ok(2));

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(promise.get_result(), Err(TaskError::Cancelled));
        assert_eq!(pool.metrics().cancelled, 1);
        pool.shutdown();
    }

    #[test]
    fn test_cancel_task_by_id() {
        let pool = single_worker();
        let gate = hold_worker(&pool);

        let task: Task<u32> = Task::new(|_| Ok(1));
        let promise = pool.submit(&task).unwrap();
        let id = task.id().unwrap();

        pool.cancel_task(id, false).unwrap();
        assert_eq!(promise.state(), PromiseState::Cancelled);
        assert_eq!(
            pool.cancel_task(id, false),
            Err(PoolError::TaskNotInFlight(id))
        );
        gate.open();
        pool.shutdown();
    }

    #[test]
    fn test_interrupting_running_task() {
        let pool = single_worker();
        let (started_tx, started) = bounded(1);
        let task: Task<u32> = Task::new(move |ctx| {
            let _ = started_tx.send(());
            loop {
                ctx.sleep(Duration::from_millis(10))?;
            }
        });
        let promise = pool.submit(&task).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        promise.cancel(true).unwrap();
        assert!(wait_until(|| task.state() == TaskState::Cancelled));
        assert_eq!(promise.get_result(), Err(TaskError::Cancelled));

        // a fresh worker replaces the interrupted one
        let next: Task<u32> = Task::new(|_| Ok(9));
        assert_eq!(
            pool.submit(&next)
                .unwrap()
                .get_result_timeout(Duration::from_secs(5)),
            Ok(9)
        );
        pool.shutdown();
    }

    #[test]
    fn test_execution_timeout_cancels_cooperative_task() {
        let pool = PoolManager::new().unwrap();
        let (reached_tx, reached) = bounded(1);
        let (slept_tx, slept) = bounded(1);
        let task: Task<u32> = Task::builder(move |ctx| {
            let _ = reached_tx.send(());
            let outcome = ctx.sleep(Duration::from_secs(5));
            let _ = slept_tx.send(outcome.clone());
            outcome?;
            Ok(1)
        })
        .execution_timeout(Duration::from_millis(30))
        .build();

        let started = Instant::now();
        let result = pool
            .submit(&task)
            .unwrap()
            .get_result_timeout(Duration::from_secs(3));
        assert_eq!(result, Err(TaskError::Cancelled));

        // the body got to the sleep and was woken by the timeout hook
        assert!(reached.recv_timeout(Duration::from_secs(3)).is_ok());
        assert_eq!(
            slept.recv_timeout(Duration::from_secs(3)),
            Ok(Err(TaskError::Interrupted))
        );
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(wait_until(|| task.state() == TaskState::Cancelled));
        pool.shutdown();
    }

    #[test]
    fn test_sleep_waits_full_duration() {
        let pool = PoolManager::new().unwrap();
        let task: Task<Duration> = Task::new(|ctx| {
            let started = Instant::now();
            ctx.sleep(Duration::from_millis(20))?;
            Ok(started.elapsed())
        });
        let slept = pool
            .submit(&task)
            .unwrap()
            .get_result_timeout(Duration::from_secs(3))
            .unwrap();
        assert!(slept >= Duration::from_millis(20), "woke after {slept:?}");
        pool.shutdown();
    }

    struct CountingPolicy {
        inner: LinearWithRealTimePriority,
        queue_timeouts: Arc<AtomicUsize>,
    }

    impl PoolPolicy for CountingPolicy {
        fn on_start_up(&self, ctl: &mut PoolControl<'_>) -> Result<(), PoolError> {
            self.inner.on_start_up(ctl)
        }

        fn on_task_added(
            &self,
            ctl: &mut PoolControl<'_>,
            state: &PoolState,
            task: &TaskRef,
        ) -> Result<(), PoolError> {
            self.inner.on_task_added(ctl, state, task)
        }

        fn on_task_queue_timeout(
            &self,
            ctl: &mut PoolControl<'_>,
            _state: &PoolState,
            task: &TaskRef,
        ) -> Result<(), PoolError> {
            self.queue_timeouts.fetch_add(1, Ordering::SeqCst);
            ctl.cancel_task(task, false)
        }
    }

    #[test]
    fn test_queue_timeout_hook_fires_once() {
        init_tracing();
        let queue_timeouts = Arc::new(AtomicUsize::new(0));
        let policy = CountingPolicy {
            inner: LinearWithRealTimePriority::new(1),
            queue_timeouts: Arc::clone(&queue_timeouts),
        };
        let pool = PoolManager::with_policy(Config::default(), policy).unwrap();
        let gate = hold_worker(&pool);

        let task: Task<u32> = Task::builder(|_| Ok(1))
            .queue_timeout(Duration::from_millis(20))
            .build();
        let promise = pool.submit(&task).unwrap();

        assert_eq!(
            promise.get_result_timeout(Duration::from_secs(5)),
            Err(TaskError::Cancelled)
        );
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue_timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Cancelled);

        gate.open();
        pool.shutdown();
    }

    #[test]
    fn test_started_task_ignores_queue_timeout() {
        let pool = PoolManager::new().unwrap();
        let task: Task<u32> = Task::builder(|ctx| {
            ctx.sleep(Duration::from_millis(300))?;
            Ok(3)
        })
        .queue_timeout(Duration::from_millis(200))
        .build();
        assert_eq!(pool.submit(&task).unwrap().get_result(), Ok(3));
        pool.shutdown();
    }

    #[test]
    fn test_equal_tasks_merge() {
        let pool = single_worker();
        let gate = hold_worker(&pool);
        let runs = Arc::new(AtomicUsize::new(0));

        let make = |runs: Arc<AtomicUsize>| -> Task<u32> {
            Task::builder(move |_| Ok(runs.fetch_add(1, Ordering::SeqCst) as u32 + 100))
                .merge_key("nightly-report")
                .build()
        };
        let first = make(Arc::clone(&runs));
        let second = make(Arc::clone(&runs));

        let first_promise = pool.submit(&first).unwrap();
        let second_promise = pool.submit(&second).unwrap();
        assert_eq!(pool.metrics().merged, 1);
        assert_eq!(pool.state().queued_tasks(), 1);

        gate.open();
        assert_eq!(first_promise.get_result(), Ok(100));
        assert_eq!(second_promise.get_result(), Ok(100));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(wait_until(|| second.state() == TaskState::Finished));
        pool.shutdown();
    }

    #[test]
    fn test_different_merge_keys_do_not_merge() {
        let pool = PoolManager::new().unwrap();
        let a: Task<u32> = Task::builder(|_| Ok(1)).merge_key(1u8).build();
        let b: Task<u32> = Task::builder(|_| Ok(2)).merge_key(2u8).build();
        let pa = pool.submit(&a).unwrap();
        let pb = pool.submit(&b).unwrap();
        assert_eq!((pa.get_result(), pb.get_result()), (Ok(1), Ok(2)));
        assert_eq!(pool.metrics().merged, 0);
        pool.shutdown();
    }

    /// Report key whose hash ignores the report name.
    #[derive(Debug, PartialEq, Eq)]
    struct ReportKey(&'static str);

    impl std::hash::Hash for ReportKey {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            std::hash::Hash::hash(&0u8, state);
        }
    }

    #[test]
    fn test_colliding_merge_keys_do_not_merge() {
        let pool = single_worker();
        let gate = hold_worker(&pool);
        let a: Task<&'static str> = Task::builder(|_| Ok("daily"))
            .merge_key(ReportKey("daily"))
            .build();
        let b: Task<&'static str> = Task::builder(|_| Ok("weekly"))
            .merge_key(ReportKey("weekly"))
            .build();
        let pa = pool.submit(&a).unwrap();
        let pb = pool.submit(&b).unwrap();
        assert_eq!(pool.metrics().merged, 0);
        assert_eq!(pool.state().queued_tasks(), 2);

        gate.open();
        assert_eq!((pa.get_result(), pb.get_result()), (Ok("daily"), Ok("weekly")));
        pool.shutdown();
    }

    #[test]
    fn test_progress_reaches_callbacks_in_order() {
        let pool = PoolManager::new().unwrap();
        let (go_tx, go) = bounded::<()>(1);
        let task: Task<&'static str, u8> = Task::new(move |ctx| {
            go.recv().map_err(|_| TaskError::msg("never released"))?;
            for step in 1..=4 {
                ctx.notify_progress(step)?;
            }
            Ok("done")
        });

        let promise = pool.submit(&task).unwrap();
        let (tx, rx) = unbounded();
        promise.progress(move |step| tx.send(*step).unwrap());
        go_tx.send(()).unwrap();

        assert_eq!(promise.get_result(), Ok("done"));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        pool.shutdown();
    }

    #[test]
    fn test_block_on_inside_task() {
        let pool = PoolManager::new().unwrap();
        let task: Task<u32> = Task::new(|ctx| {
            let value = ctx.block_on(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                21
            })?;
            Ok(value * 2)
        });
        assert_eq!(pool.submit(&task).unwrap().get_result(), Ok(42));
        pool.shutdown();
    }

    #[test]
    fn test_metrics_track_outcomes() {
        let pool = PoolManager::new().unwrap();
        let promises: Vec<_> = (0..12u32)
            .map(|i| {
                let task: Task<u32> = Task::new(move |_| {
                    if i % 6 == 5 {
                        Err(TaskError::msg("odd one out"))
                    } else {
                        Ok(i)
                    }
                });
                pool.submit(&task).unwrap()
            })
            .collect();
        let all = pool.after_all(promises);
        let outcomes = all.get_result().unwrap();
        assert_eq!(outcomes.len(), 12);

        assert!(wait_until(|| pool.metrics().finished() == 12));
        let metrics = pool.metrics();
        assert_eq!(metrics.submitted, 12);
        assert_eq!(metrics.completed, 10);
        assert_eq!(metrics.failed, 2);
        assert!((metrics.success_rate() - 10.0 / 12.0).abs() < f64::EPSILON);
        pool.shutdown();
    }

    #[test]
    fn test_pool_state_snapshot() {
        let pool = single_worker();
        let gate = hold_worker(&pool);

        let state = pool.state();
        let queue = state.queue(LinearWithRealTimePriority::QUEUE).unwrap();
        assert_eq!(queue.worker_count(), 1);
        assert_eq!(queue.workers[0].status, WorkerStatus::Running);
        assert!(queue.workers[0].current_task.is_some());
        assert!(state.to_string().contains("q1"));

        gate.open();
        pool.shutdown();
    }

    struct TwoQueuesTwice;

    impl PoolPolicy for TwoQueuesTwice {
        fn on_start_up(&self, ctl: &mut PoolControl<'_>) -> Result<(), PoolError> {
            ctl.create_queue(QueueId(7))?;
            ctl.create_queue(QueueId(7))
        }

        fn on_task_added(
            &self,
            ctl: &mut PoolControl<'_>,
            _state: &PoolState,
            task: &TaskRef,
        ) -> Result<(), PoolError> {
            ctl.queue_task(QueueId(7), task)
        }
    }

    #[test]
    fn test_policy_errors_surface() {
        let result = PoolManager::with_policy(Config::default(), TwoQueuesTwice);
        assert_eq!(result.err(), Some(PoolError::DuplicateQueue(QueueId(7))));
    }

    struct NoWorkers;

    impl PoolPolicy for NoWorkers {
        fn on_task_added(
            &self,
            ctl: &mut PoolControl<'_>,
            _state: &PoolState,
            task: &TaskRef,
        ) -> Result<(), PoolError> {
            ctl.queue_task(QueueId(3), task)
        }
    }

    #[test]
    fn test_refused_task_is_cancelled() {
        let pool = PoolManager::with_policy(Config::default(), NoWorkers).unwrap();
        let task: Task<u32> = Task::new(|_| Ok(1));
        assert_eq!(
            pool.submit(&task).err(),
            Some(PoolError::UnknownQueue(QueueId(3)))
        );
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(
            task.promise().map(|promise| promise.state()),
            Some(PromiseState::Cancelled)
        );
    }

    #[test]
    fn test_shutdown_cancels_queued_work() {
        let pool = single_worker();
        let gate = hold_worker(&pool);
        let task: Task<u32> = Task::new(|_| Ok(1));
        let queued = pool.submit(&task).unwrap();

        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            gate.open();
        });
        pool.shutdown();
        opener.join().unwrap();

        assert_eq!(queued.get_result(), Err(TaskError::Cancelled));
        assert!(pool.is_shut_down());
        let late: Task<u32> = Task::new(|_| Ok(2));
        assert!(matches!(pool.submit(&late), Err(PoolError::ShutDown)));
    }

    struct FakeUi {
        sender: Sender<Job>,
        thread: thread::ThreadId,
    }

    impl FakeUi {
        fn spawn() -> Arc<FakeUi> {
            let (sender, receiver) = unbounded::<Job>();
            let handle = thread::Builder::new()
                .name("fake-ui".into())
                .spawn(move || {
                    for job in receiver {
                        job();
                    }
                })
                .unwrap();
            Arc::new(FakeUi {
                sender,
                thread: handle.thread().id(),
            })
        }
    }

    impl UiThread for FakeUi {
        fn is_current_thread(&self) -> bool {
            thread::current().id() == self.thread
        }

        fn post(&self, job: Job) {
            let _ = self.sender.send(job);
        }
    }

    #[test]
    fn test_ui_affine_callbacks_run_on_ui_thread() {
        let pool = PoolManager::with_ui_thread(Config::default(), FakeUi::spawn()).unwrap();
        let task: Task<u32> = Task::new(|_| Ok(11));
        let promise = pool.submit(&task).unwrap();

        let (tx, rx) = unbounded();
        promise.done_with(Affinity::Ui, move |value| {
            let name = thread::current().name().map(String::from);
            tx.send((name, *value)).unwrap();
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (Some("fake-ui".to_string()), 11)
        );
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_await_task_promise() {
        let pool = PoolManager::new().unwrap();
        let task: Task<String> = Task::new(|_| Ok("awaited".to_string()));
        let value = pool.submit(&task).unwrap().await;
        assert_eq!(value.as_deref(), Ok("awaited"));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_join_many_task_promises() {
        let pool = PoolManager::new().unwrap();
        let promises: Vec<_> = (0..16u32)
            .map(|i| {
                let task: Task<u32> = Task::new(move |_| Ok(i * i));
                pool.submit(&task).unwrap()
            })
            .collect();
        let squares: Vec<u32> = futures::future::join_all(promises)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(squares, (0..16u32).map(|i| i * i).collect::<Vec<_>>());
        pool.shutdown();
    }
}
