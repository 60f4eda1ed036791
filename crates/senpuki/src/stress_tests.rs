//! End-to-end scenarios exercising dispatch, the worker loop, and the
//! orchestrator driver together against the in-memory backend.

#[cfg(test)]
mod stress_tests {
    use crate::bus::InProcessBus;
    use crate::executor::{DispatchOptions, Executor, ServeOptions};
    use crate::model::TaskState;
    use crate::registry::DurableFn;
    use crate::retry::RetryPolicy;
    use crate::worker::WorkerLifecycle;
    use crate::SenpukiError;
    use futures::future::BoxFuture;
    use senpuki_testing::MemoryBackend;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_executor() -> (Executor, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let bus = Arc::new(InProcessBus::new());
        (Executor::new(backend.clone(), bus), backend)
    }

    struct Add;
    impl DurableFn for Add {
        type Args = (i64, i64);
        type Output = i64;
        const NAME: &'static str = "senpuki::stress_tests::Add";
        fn call(args: Self::Args, _ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move { Ok(args.0 + args.1) })
        }
    }

    struct Mul;
    impl DurableFn for Mul {
        type Args = (i64, i64);
        type Output = i64;
        const NAME: &'static str = "senpuki::stress_tests::Mul";
        fn call(args: Self::Args, _ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move { Ok(args.0 * args.1) })
        }
    }

    struct Square;
    impl DurableFn for Square {
        type Args = i64;
        type Output = i64;
        const NAME: &'static str = "senpuki::stress_tests::Square";
        fn call(args: Self::Args, _ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move { Ok(args * args) })
        }
    }

    struct AddThenMul;
    impl DurableFn for AddThenMul {
        type Args = (i64, i64, i64);
        type Output = i64;
        const NAME: &'static str = "senpuki::stress_tests::AddThenMul";
        fn meta() -> crate::registry::FunctionMeta {
            crate::registry::FunctionMeta::orchestrator()
        }
        fn call(args: Self::Args, ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move {
                let sum: i64 = ctx.call(Add::NAME, &(args.0, args.1)).await?;
                let product: i64 = ctx.call(Mul::NAME, &(sum, args.2)).await?;
                Ok(product)
            })
        }
    }

    struct SquareAll;
    impl DurableFn for SquareAll {
        type Args = Vec<i64>;
        type Output = Vec<i64>;
        const NAME: &'static str = "senpuki::stress_tests::SquareAll";
        fn meta() -> crate::registry::FunctionMeta {
            crate::registry::FunctionMeta::orchestrator()
        }
        fn call(args: Self::Args, ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<Vec<i64>, SenpukiError>> {
            Box::pin(async move { crate::orchestrator::map(&ctx, Square::NAME, &args, 0).await })
        }
    }

    // Attempts are tracked on the task row itself (`ctx.attempt()`), so this
    // needs no external counter to know which attempt it's on.
    struct Flaky;
    impl DurableFn for Flaky {
        type Args = u32;
        type Output = &'static str;
        const NAME: &'static str = "senpuki::stress_tests::Flaky";
        fn meta() -> crate::registry::FunctionMeta {
            crate::registry::FunctionMeta::activity().with_retry_policy(RetryPolicy::new(
                5,
                Duration::from_millis(5),
                Duration::from_millis(50),
                2.0,
                0.2,
            ))
        }
        fn call(fail_until: Self::Args, ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<&'static str, SenpukiError>> {
            Box::pin(async move {
                if ctx.attempt() < fail_until {
                    Err(SenpukiError::Retryable("not yet".into()))
                } else {
                    Ok("done")
                }
            })
        }
    }

    struct AlwaysFail;
    impl DurableFn for AlwaysFail {
        type Args = ();
        type Output = ();
        const NAME: &'static str = "senpuki::stress_tests::AlwaysFail";
        fn meta() -> crate::registry::FunctionMeta {
            crate::registry::FunctionMeta::activity().with_retry_policy(RetryPolicy::new(
                2,
                Duration::from_millis(1),
                Duration::from_millis(5),
                2.0,
                0.0,
            ))
        }
        fn call(_args: (), _ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<(), SenpukiError>> {
            Box::pin(async move { Err(SenpukiError::Retryable("always fails".into())) })
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Approval {
        ok: bool,
    }

    struct AwaitApproval;
    impl DurableFn for AwaitApproval {
        type Args = ();
        type Output = Approval;
        const NAME: &'static str = "senpuki::stress_tests::AwaitApproval";
        fn meta() -> crate::registry::FunctionMeta {
            crate::registry::FunctionMeta::orchestrator()
        }
        fn call(_args: (), ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<Approval, SenpukiError>> {
            Box::pin(async move { ctx.wait_for_signal("approve", None).await })
        }
    }

    struct SlowAdd;
    impl DurableFn for SlowAdd {
        type Args = (i64, i64);
        type Output = i64;
        const NAME: &'static str = "senpuki::stress_tests::SlowAdd";
        fn call(args: Self::Args, _ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(args.0 + args.1)
            })
        }
    }

    struct SleepThenAnswer;
    impl DurableFn for SleepThenAnswer {
        type Args = ();
        type Output = i64;
        const NAME: &'static str = "senpuki::stress_tests::SleepThenAnswer";
        fn meta() -> crate::registry::FunctionMeta {
            crate::registry::FunctionMeta::orchestrator()
        }
        fn call(_args: (), ctx: crate::ExecutionContext) -> BoxFuture<'static, Result<i64, SenpukiError>> {
            Box::pin(async move {
                // Scaled down from the nominal 60s for test speed; the
                // mechanism under test (park across a worker restart) is
                // independent of the actual sleep length.
                ctx.sleep(Duration::from_millis(150)).await?;
                Ok(42)
            })
        }
    }

    fn default_serve_options() -> ServeOptions {
        let mut options = ServeOptions::default();
        options.poll_interval = Duration::from_millis(10);
        options.cleanup_interval = None;
        options
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s1_linear_orchestrator_completes_in_call_order() {
        let (mut executor, backend) = new_executor();
        executor.register::<Add>();
        executor.register::<Mul>();
        executor.register::<AddThenMul>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor.dispatch::<AddThenMul>((2, 3, 4), DispatchOptions::default()).await.unwrap();
        let result: i64 = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, 20);

        let completed_activities = backend
            .clone()
            .list_tasks(Some(execution_id), Some(TaskState::Completed), usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == crate::model::TaskKind::Activity)
            .count();
        assert_eq!(completed_activities, 2);

        let root = backend
            .list_tasks(Some(execution_id), None, usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.parent_task_id.is_none())
            .unwrap();
        assert_eq!(root.progress.len(), 2);

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s2_fan_out_preserves_input_order() {
        let (mut executor, _backend) = new_executor();
        executor.register::<Square>();
        executor.register::<SquareAll>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor
            .dispatch::<SquareAll>(vec![1, 2, 3, 4, 5], DispatchOptions::default())
            .await
            .unwrap();
        let result: Vec<i64> = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, vec![1, 4, 9, 16, 25]);

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s3_retry_eventually_succeeds_within_attempt_budget() {
        let (mut executor, backend) = new_executor();
        executor.register::<Flaky>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor.dispatch::<Flaky>(3, DispatchOptions::default()).await.unwrap();
        let result: &str = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, "done");

        let root = backend
            .list_tasks(Some(execution_id), Some(TaskState::Completed), usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(root.attempt, 3);

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s4_dead_letter_and_replay_onto_a_different_queue() {
        let (mut executor, _backend) = new_executor();
        executor.register::<AlwaysFail>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor.dispatch::<AlwaysFail>((), DispatchOptions::default()).await.unwrap();
        let outcome: Result<(), _> = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await;
        assert!(outcome.is_err());

        let letters = executor.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        let dead_task_id = letters[0].id;

        let replayed_id = executor.replay_dead_letter(dead_task_id, Some("retry".into())).await.unwrap();
        assert_ne!(replayed_id, dead_task_id);
        assert!(executor.get_dead_letter(dead_task_id).await.unwrap().is_some());

        handle.stop().await;

        let retry_lifecycle = WorkerLifecycle::new("retry-worker");
        let mut retry_options = default_serve_options();
        retry_options.queues = vec!["retry".into()];
        let retry_handle = executor.serve(retry_lifecycle, retry_options);
        tokio::time::sleep(Duration::from_millis(100)).await;
        retry_handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s5_signal_wakes_a_parked_orchestrator() {
        let (mut executor, _backend) = new_executor();
        executor.register::<AwaitApproval>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor.dispatch::<AwaitApproval>((), DispatchOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.send_signal(execution_id, "approve", &Approval { ok: true }).await.unwrap();

        let result: Approval = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, Approval { ok: true });

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s6_durable_sleep_survives_a_worker_restart() {
        let (mut executor, _backend) = new_executor();
        executor.register::<SleepThenAnswer>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor.dispatch::<SleepThenAnswer>((), DispatchOptions::default()).await.unwrap();
        // Let the orchestrator run once, park on the sleep, then kill the
        // worker well before the sleep elapses.
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;

        let restarted = executor.serve(WorkerLifecycle::new("w2"), default_serve_options());
        let result: i64 = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, 42);
        restarted.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s7_cancelling_an_execution_aborts_its_next_claim_before_user_code_runs() {
        let (mut executor, backend) = new_executor();
        executor.register::<SlowAdd>();

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, default_serve_options());

        let execution_id = executor.dispatch::<SlowAdd>((1, 1), DispatchOptions::default()).await.unwrap();
        // Cancel well before the (slow) activity body would otherwise claim
        // and start running.
        executor.cancel(execution_id).await.unwrap();

        let outcome: Result<i64, _> = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await;
        assert!(matches!(outcome, Err(crate::error::WaitError::Cancelled)));

        let letters = backend.list_tasks(Some(execution_id), Some(TaskState::Dead), usize::MAX).await.unwrap();
        assert_eq!(letters.len(), 1);

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s8_deadline_reached_mid_execution_settles_as_timed_out() {
        let (mut executor, _backend) = new_executor();
        executor.register::<SlowAdd>();

        // A short lease_duration keeps the heartbeat (which now also polls
        // expires_at) running often enough to observe the deadline well
        // before the 300ms body would otherwise return.
        let mut serve_options = default_serve_options();
        serve_options.lease_duration = Duration::from_millis(40);

        let lifecycle = WorkerLifecycle::new("w1");
        let handle = executor.serve(lifecycle, serve_options);

        let options = DispatchOptions { expiry: Some(Duration::from_millis(50)), ..Default::default() };
        let execution_id = executor.dispatch::<SlowAdd>((1, 1), options).await.unwrap();

        let outcome: Result<i64, _> = executor.wait_for(execution_id, Some(Duration::from_secs(5))).await;
        assert!(matches!(outcome, Err(crate::error::WaitError::TimedOut)));

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn property_dispatch_count_matches_the_number_of_executions_created() {
        let (mut executor, backend) = new_executor();
        executor.register::<Add>();

        let inflight = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            inflight.fetch_add(1, Ordering::SeqCst);
            executor.dispatch::<Add>((1, 1), DispatchOptions::default()).await.unwrap();
        }
        assert_eq!(backend.task_count().await, 10);
        assert_eq!(inflight.load(Ordering::SeqCst), 10);
    }
}
