use proptest::prelude::*;
use sciflow_sandbox::protocol::{DATASET_PATH, SCRIPT_PATH};
use sciflow_sandbox::{
    ExecOutput, OwnerLabel, PoolConfig, RunFailure, SandboxError, SandboxPool,
};
use sciflow_test_utils::{summing_responder, MockBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn config(capacity: usize) -> PoolConfig {
    PoolConfig::default().with_capacity(capacity)
}

async fn pool_with(backend: &MockBackend, capacity: usize) -> SandboxPool {
    SandboxPool::initialize(Arc::new(backend.clone()), config(capacity)).await
}

#[tokio::test]
async fn initialize_fills_pool_to_capacity() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 3).await;

    assert!(pool.is_available());
    assert_eq!(pool.warm_count().await, 3);
    assert_eq!(backend.live_count(), 3);
}

#[tokio::test]
async fn orphans_from_previous_process_are_pruned() {
    let backend = MockBackend::new();
    let label = OwnerLabel::default();
    let orphan_a = backend.seed_orphan(&label);
    let orphan_b = backend.seed_orphan(&label);
    let foreign = backend.seed_orphan(&OwnerLabel::new("someone_else", "true"));

    let pool = pool_with(&backend, 2).await;

    assert!(!backend.is_live(&orphan_a));
    assert!(!backend.is_live(&orphan_b));
    assert!(backend.is_live(&foreign), "unlabeled containers must survive");
    assert_eq!(pool.warm_count().await, 2);
}

#[tokio::test]
async fn unreachable_backend_degrades_instead_of_failing() {
    let backend = MockBackend::unreachable();
    let pool = pool_with(&backend, 3).await;

    assert!(!pool.is_available());
    let err = pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap_err();
    assert!(matches!(err, SandboxError::Unavailable(_)));
    assert!(err.to_string().contains("sandboxing unavailable"));
}

#[tokio::test]
async fn run_injects_dataset_and_wrapped_script() {
    let backend = MockBackend::new().with_responder(|exec| {
        assert_eq!(exec.argv, ["python", SCRIPT_PATH]);
        assert_eq!(exec.file_text(DATASET_PATH), "A\n1\n2\n3\n");
        assert!(exec.script().contains("    print(df['A'].sum())"));
        ExecOutput::stdout("6\n")
    });
    let pool = pool_with(&backend, 1).await;

    let outcome = pool
        .run("print(df['A'].sum())", b"A\n1\n2\n3\n", TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.output, "6");
}

#[tokio::test]
async fn sum_of_column_a_is_six() {
    let backend = MockBackend::new().with_responder(summing_responder);
    let pool = pool_with(&backend, 1).await;

    let outcome = pool
        .run("print(df['A'].sum())", b"A\n1\n2\n3\n", TIMEOUT)
        .await
        .unwrap();
    assert!(outcome.output.contains('6'));
}

#[tokio::test]
async fn every_run_uses_a_fresh_sandbox() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 1).await;

    let before = pool.stats().await;
    pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap();
    pool.run("print(2)", b"A\n1\n", TIMEOUT).await.unwrap();
    let after = pool.stats().await;

    assert_eq!(after.total_destroyed - before.total_destroyed, 2);
    assert_eq!(after.total_created - before.total_created, 2);
    assert_eq!(backend.removed().len(), 2);
    assert_eq!(after.runs, 2);
}

#[tokio::test]
async fn script_error_is_reported_and_sandbox_still_replaced() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 2).await;

    let outcome = pool.run("raise ValueError()", b"A\n1\n", TIMEOUT).await.unwrap();
    assert!(!outcome.is_success());
    assert_eq!(
        outcome.display_text(),
        "Error: Error executing code: boom"
    );
    assert_eq!(pool.warm_count().await, 2);
}

#[tokio::test]
async fn empty_pool_creates_on_demand() {
    let backend = MockBackend::new();
    backend.fail_next_creates(1);
    let pool = pool_with(&backend, 1).await;
    assert_eq!(pool.warm_count().await, 0);

    let outcome = pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap();
    assert!(outcome.is_success());

    let stats = pool.stats().await;
    assert_eq!(stats.on_demand_creations, 1);
    assert_eq!(stats.failed_creations, 1);
    assert_eq!(stats.warm, 1);
}

#[tokio::test]
async fn refill_failure_shrinks_pool_temporarily() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 2).await;

    backend.fail_next_creates(1);
    pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap();
    assert_eq!(pool.warm_count().await, 1);

    pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap();
    assert_eq!(pool.warm_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_kills_sandbox_and_reports_timeout() {
    let backend = MockBackend::new().with_exec_delay(Duration::from_secs(60));
    let pool = pool_with(&backend, 1).await;

    let outcome = pool
        .run("while True: pass", b"A\n1\n", Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(outcome.error, Some(RunFailure::Timeout(Duration::from_secs(2))));
    assert!(outcome.display_text().contains("timed out"));
    assert_eq!(backend.removed().len(), 1);
    assert_eq!(pool.warm_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_abandons_run_and_destroys_sandbox() {
    let backend = MockBackend::new().with_exec_delay(Duration::from_secs(60));
    let pool = pool_with(&backend, 1).await;
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        })
    };

    let err = pool
        .run_cancellable("while True: pass", b"A\n1\n", Duration::from_secs(30), &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, SandboxError::Cancelled));

    for _ in 0..50 {
        if backend.removed().len() == 1 && pool.warm_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.removed().len(), 1);
    assert_eq!(pool.warm_count().await, 1);
}

#[tokio::test]
async fn shutdown_destroys_warm_sandboxes() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 3).await;

    assert_eq!(pool.shutdown().await, 3);
    assert_eq!(backend.live_count(), 0);
    assert!(!pool.is_available());
    assert!(pool.acquire().await.is_err());
}

#[tokio::test]
async fn backend_lost_after_initialize_reports_unavailable() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 2).await;
    assert!(pool.is_available());

    backend.set_reachable(false);
    let err = pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap_err();
    assert!(err.is_unavailable(), "got {err:?}");
    assert!(!err.is_retryable());
    assert!(!pool.is_available());
    assert_eq!(backend.exec_count(), 0);

    let err = pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn pool_recovers_once_backend_answers_again() {
    let backend = MockBackend::new();
    let pool = pool_with(&backend, 1).await;

    backend.set_reachable(false);
    assert!(pool.run("print(1)", b"A\n1\n", TIMEOUT).await.is_err());

    backend.set_reachable(true);
    let outcome = pool.run("print(1)", b"A\n1\n", TIMEOUT).await.unwrap();
    assert!(outcome.is_success());
    assert!(pool.is_available());
}

#[tokio::test(start_paused = true)]
async fn shutdown_removes_sandbox_of_cancelled_run() {
    let backend = MockBackend::new().with_exec_delay(Duration::from_secs(60));
    let pool = pool_with(&backend, 1).await;
    let token = CancellationToken::new();

    let run = pool.run_cancellable("while True: pass", b"A\n1\n", Duration::from_secs(30), &token);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    };
    let (res, ()) = tokio::join!(run, cancel);
    assert!(matches!(res, Err(SandboxError::Cancelled)));

    pool.shutdown().await;
    assert_eq!(backend.live_count(), 0);
    assert_eq!(pool.stats().await.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_removes_sandbox_of_dropped_run() {
    let backend = MockBackend::new().with_exec_delay(Duration::from_secs(60));
    let pool = pool_with(&backend, 1).await;

    tokio::select! {
        _ = pool.run("while True: pass", b"A\n1\n", Duration::from_secs(30)) => {
            panic!("run should still be executing");
        }
        () = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    assert_eq!(pool.shutdown().await, 1);
    assert_eq!(backend.live_count(), 0);
    assert!(!pool.is_available());
}

#[tokio::test]
async fn concurrent_runs_restore_capacity() {
    let backend = MockBackend::new().with_exec_delay(Duration::from_millis(5));
    let pool = pool_with(&backend, 2).await;

    let runs = (0..6).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.run(&format!("print({i})"), b"A\n1\n", TIMEOUT).await
        })
    });
    for handle in futures::future::join_all(runs).await {
        assert!(handle.unwrap().unwrap().is_success());
    }

    assert_eq!(pool.warm_count().await, 2);
    assert_eq!(backend.live_count(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_pool_size_returns_to_capacity(capacity in 1usize..5, scripts in prop::collection::vec(any::<bool>(), 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let backend = MockBackend::new();
            let pool = pool_with(&backend, capacity).await;
            for failing in scripts {
                let code = if failing { "raise RuntimeError()" } else { "print(1)" };
                pool.run(code, b"A\n1\n", TIMEOUT).await.unwrap();
                prop_assert_eq!(pool.warm_count().await, capacity);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
