use async_trait::async_trait;
use proptest::prelude::*;
use sciflow_core::{
    CacheKeyMode, CodeGenerator, Dataset, FlowConfig, FlowError, FlowMode, FlowRequest,
    FlowState, FlowStatus, GenerationError, ScientificFlow, FALLBACK_PLAN,
};
use sciflow_memory::{JsonFileStore, MemoryStore, WorkingMemory};
use sciflow_sandbox::{PoolConfig, SandboxPool};
use sciflow_test_utils::{
    dataset_a, dataset_scores, summing_responder, FailingGenerator, MockBackend, ScriptedGenerator,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SUM_A: &str = "```python\nprint(df['A'].sum())\n```";

fn fast_config() -> FlowConfig {
    FlowConfig::default().with_planning(false)
}

async fn pool_for(backend: &MockBackend) -> SandboxPool {
    SandboxPool::initialize(Arc::new(backend.clone()), PoolConfig::default().with_capacity(1)).await
}

async fn flow(
    backend: &MockBackend,
    config: FlowConfig,
    coder: Arc<dyn CodeGenerator>,
) -> ScientificFlow {
    ScientificFlow::new(config, coder, pool_for(backend).await, Arc::new(WorkingMemory::in_memory()))
}

fn request(instruction: &str, dataset: Dataset) -> FlowRequest {
    FlowRequest::new(instruction, Arc::new(dataset))
}

#[tokio::test]
async fn end_to_end_sum_is_six() {
    let backend = MockBackend::new().with_responder(summing_responder);
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, fast_config(), coder.clone()).await;

    let response = flow.run(request("Sum column A", dataset_a())).await.unwrap();

    assert_eq!(response.status, FlowStatus::Completed);
    assert!(response.result.starts_with('6'), "got {:?}", response.result);
    assert_eq!(response.code, "print(df['A'].sum())");
    assert_eq!(response.attempts.len(), 1);
    assert!(response.guardrail.as_ref().is_some_and(|g| g.safe));
    assert!(response.evaluation.is_some());
    assert_eq!(response.reviews.len(), 3);

    let entries = flow.memory().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].instruction, "Sum column A");
    assert_eq!(entries[0].meta, json!({ "columns": ["A"], "shape": [3, 1] }));
}

#[tokio::test]
async fn retry_feeds_previous_error_into_next_prompt() {
    let backend = MockBackend::new();
    let coder = Arc::new(ScriptedGenerator::failing_then_ok(1));
    let flow = flow(&backend, fast_config(), coder.clone()).await;

    let response = flow.run(request("Mean of A", dataset_a())).await.unwrap();

    assert_eq!(response.attempts.len(), 2);
    assert!(response.attempts[0].is_error());
    assert!(!response.attempts[1].is_error());
    assert!(response.result.starts_with("ok"));

    let prompts = coder.prompts();
    assert!(!prompts[0].contains("previous attempt"));
    assert!(prompts[1].contains("Error executing code: boom"));
    assert_eq!(backend.exec_count(), 2);
}

#[tokio::test]
async fn exhausted_retries_return_last_error_without_persisting() {
    let backend = MockBackend::new();
    let coder = Arc::new(ScriptedGenerator::failing_then_ok(10));
    let flow = flow(&backend, fast_config(), coder.clone()).await;

    let response = flow.run(request("Mean of A", dataset_a())).await.unwrap();

    assert_eq!(response.status, FlowStatus::Completed);
    assert_eq!(response.attempts.len(), 3);
    assert_eq!(response.result, "Error: Error executing code: boom");
    assert_eq!(response.code, "raise ValueError('boom')");
    assert!(response.evaluation.is_none());
    assert!(flow.memory().is_empty().await);
}

#[tokio::test]
async fn planning_mode_stops_at_checkpoint() {
    let backend = MockBackend::new();
    let planner = Arc::new(ScriptedGenerator::new(["<thought>Thinking...</thought> Plan: Do X."]));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, FlowConfig::default(), coder.clone())
        .await
        .with_planner(planner.clone());

    let response = flow
        .run(request("Sum column A", dataset_a()).with_mode(FlowMode::Planning))
        .await
        .unwrap();

    assert_eq!(response.status, FlowStatus::WaitingConfirmation);
    assert_eq!(response.code, "");
    assert_eq!(response.result, "Plan: Do X.");
    assert_eq!(response.thought.as_deref(), Some("Thinking..."));
    assert!(response.attempts.is_empty());
    assert_eq!(coder.calls(), 0);
    assert_eq!(backend.exec_count(), 0);
    assert!(flow.memory().is_empty().await);
}

#[tokio::test]
async fn planning_checkpoint_holds_even_with_planning_disabled() {
    let backend = MockBackend::new();
    let coder = Arc::new(ScriptedGenerator::new(["1. Sum A"]));
    let flow = flow(&backend, fast_config(), coder).await;

    let response = flow
        .run(request("Sum column A", dataset_a()).with_mode(FlowMode::Planning))
        .await
        .unwrap();
    assert_eq!(response.status, FlowStatus::WaitingConfirmation);
    assert_eq!(response.code, "");
}

#[tokio::test]
async fn confirmed_plan_skips_planning_and_is_the_instruction() {
    let backend = MockBackend::new().with_responder(summing_responder);
    let planner = Arc::new(ScriptedGenerator::new(["should not be used"]));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, FlowConfig::default(), coder.clone())
        .await
        .with_planner(planner.clone());

    let response = flow
        .run(
            request("1. Sum column A\n2. Print it", dataset_a())
                .with_mode(FlowMode::Planning)
                .confirmed(true),
        )
        .await
        .unwrap();

    assert_eq!(response.status, FlowStatus::Completed);
    assert_eq!(planner.calls(), 0);
    assert_eq!(response.plan.as_deref(), Some("1. Sum column A\n2. Print it"));
    assert!(coder.prompts()[0].contains("Instruction: 1. Sum column A\n2. Print it"));
    assert!(!coder.prompts()[0].contains("Approved Plan"));
}

#[tokio::test]
async fn fast_mode_with_planning_augments_instruction() {
    let backend = MockBackend::new().with_responder(summing_responder);
    let planner = Arc::new(ScriptedGenerator::new(["1. Sum the column"]));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, FlowConfig::default(), coder.clone())
        .await
        .with_planner(planner);

    let response = flow.run(request("Sum column A", dataset_a())).await.unwrap();

    assert_eq!(response.plan.as_deref(), Some("1. Sum the column"));
    assert!(coder.prompts()[0].contains("User Request: Sum column A\n\nApproved Plan:\n1. Sum the column"));
    assert_eq!(flow.memory().entries().await[0].plan, "1. Sum the column");
}

#[tokio::test]
async fn identical_planning_calls_hit_the_cache() {
    let backend = MockBackend::new();
    let planner = Arc::new(ScriptedGenerator::new(["1. Average A", "2. Something else"]));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, FlowConfig::default(), coder)
        .await
        .with_planner(planner.clone());

    let first = flow
        .run(request("Average A", dataset_a()).with_mode(FlowMode::Planning))
        .await
        .unwrap();
    let second = flow
        .run(request("Average A", dataset_a()).with_mode(FlowMode::Planning))
        .await
        .unwrap();

    assert_eq!(planner.calls(), 1);
    assert_eq!(first.result, "1. Average A");
    assert_eq!(second.result, first.result);
    assert_eq!(flow.cache().stats().hits, 1);
}

#[tokio::test]
async fn cached_plan_is_still_split_from_its_thought() {
    let backend = MockBackend::new();
    let planner = Arc::new(ScriptedGenerator::new(["<think>why</think>1. Average A"]));
    let flow = flow(&backend, FlowConfig::default(), planner.clone()).await;

    for _ in 0..2 {
        let response = flow
            .run(request("Average A", dataset_a()).with_mode(FlowMode::Planning))
            .await
            .unwrap();
        assert_eq!(response.result, "1. Average A");
        assert_eq!(response.thought.as_deref(), Some("why"));
    }
    assert_eq!(planner.calls(), 1);
}

#[tokio::test]
async fn content_keyed_cache_separates_same_shape_datasets() {
    let backend = MockBackend::new();
    let planner = Arc::new(ScriptedGenerator::new(["plan one", "plan two"]));
    let config = FlowConfig::default().with_cache_key_mode(CacheKeyMode::Content);
    let flow = flow(&backend, config, planner.clone()).await;

    let other = Dataset::new(vec!["A".into()], vec![vec![json!(7)], vec![json!(8)], vec![json!(9)]])
        .unwrap();
    let first = flow
        .run(request("Average A", dataset_a()).with_mode(FlowMode::Planning))
        .await
        .unwrap();
    let second = flow
        .run(request("Average A", other).with_mode(FlowMode::Planning))
        .await
        .unwrap();

    assert_eq!(planner.calls(), 2);
    assert_ne!(first.result, second.result);
}

#[tokio::test]
async fn planning_failure_falls_back_and_is_not_cached() {
    let backend = MockBackend::new().with_responder(summing_responder);
    let planner = Arc::new(FailingGenerator::default());
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, FlowConfig::default(), coder)
        .await
        .with_planner(planner.clone());

    let response = flow.run(request("Sum column A", dataset_a())).await.unwrap();
    assert_eq!(response.plan.as_deref(), Some(FALLBACK_PLAN));
    assert!(response.result.starts_with('6'));

    flow.cache().sync().await;
    assert_eq!(flow.cache().entry_count(), 0);

    flow.run(request("Sum column A", dataset_a())).await.unwrap();
    assert_eq!(planner.calls(), 2);
}

#[tokio::test]
async fn guardrail_rejection_discards_script_and_skips_memory() {
    let backend = MockBackend::new();
    let coder = Arc::new(ScriptedGenerator::new(["```python\nimport os\nos.system('ls')\n```"]));
    let flow = flow(&backend, fast_config(), coder.clone()).await;

    let response = flow.run(request("List files", dataset_a())).await.unwrap();

    assert!(response.is_guarded());
    assert_eq!(response.status, FlowStatus::Completed);
    assert_eq!(response.code, "");
    assert!(response.result.contains("OS module access"));
    assert!(response.attempts.iter().all(|a| a.code.is_empty()));
    assert!(response.evaluation.is_none());
    assert_eq!(coder.calls(), 1, "guardrail violations are never retried");
    assert!(flow.memory().is_empty().await);
}

#[tokio::test]
async fn council_findings_are_appended_to_result() {
    let backend = MockBackend::new();
    let code = "```python\nfor index, row in df.iterrows():\n    print(row['A'])\n```";
    let coder = Arc::new(ScriptedGenerator::new([code]));
    let flow = flow(&backend, fast_config(), coder).await;

    let response = flow.run(request("Print each A", dataset_a())).await.unwrap();

    assert!(response.result.starts_with("ok"));
    assert!(response.result.contains("--- Council Review ---"));
    assert!(response.result.contains("[Architect] Performance Warning"));
    let stored = &flow.memory().entries().await[0];
    assert_eq!(stored.result, response.result);
}

#[tokio::test]
async fn catalog_is_stored_as_metadata() {
    let backend = MockBackend::new();
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, fast_config(), coder).await;
    let catalog = json!({ "source": "scores.csv", "columns": { "group": "str", "score": "float" } });

    flow.run(request("Mean score by group", dataset_scores()).with_catalog(catalog.clone()))
        .await
        .unwrap();

    assert_eq!(flow.memory().entries().await[0].meta, catalog);
}

#[tokio::test(start_paused = true)]
async fn identical_concurrent_requests_plan_once() {
    let backend = MockBackend::new();
    let planner = Arc::new(ScriptedGenerator::new(["1. Sum A"]).with_delay(Duration::from_millis(50)));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, FlowConfig::default(), coder.clone())
        .await
        .with_planner(planner.clone());
    let planning = || request("Sum column A", dataset_a()).with_mode(FlowMode::Planning);

    let (a, b) = tokio::join!(flow.run(planning()), flow.run(planning()));

    assert_eq!(a.unwrap().result, "1. Sum A");
    assert_eq!(b.unwrap().result, "1. Sum A");
    assert_eq!(planner.calls(), 1);
    assert_eq!(coder.calls(), 0);
    assert_eq!(flow.cache().stats().hits, 1);
}

#[tokio::test]
async fn sandbox_unavailable_is_surfaced_without_retry() {
    let backend = MockBackend::unreachable();
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, fast_config(), coder.clone()).await;

    let err = flow.run(request("Sum column A", dataset_a())).await.unwrap_err();

    assert!(matches!(err, FlowError::SandboxUnavailable(_)));
    assert!(!err.is_retryable());
    assert_eq!(coder.calls(), 1);
    assert!(flow.memory().is_empty().await);
}

#[tokio::test]
async fn sandbox_lost_after_startup_is_surfaced_without_retry() {
    let backend = MockBackend::new();
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, fast_config().with_max_retries(2), coder.clone()).await;
    backend.set_reachable(false);

    let err = flow.run(request("Sum column A", dataset_a())).await.unwrap_err();

    assert!(matches!(err, FlowError::SandboxUnavailable(_)), "got {err:?}");
    assert_eq!(coder.calls(), 1);
    assert!(!flow.pool().is_available());
    assert!(flow.memory().is_empty().await);
}

#[tokio::test]
async fn model_unavailable_fails_fast() {
    let backend = MockBackend::new();
    let coder = Arc::new(FailingGenerator::default());
    let flow = flow(&backend, fast_config(), coder.clone()).await;

    let err = flow.run(request("Sum column A", dataset_a())).await.unwrap_err();

    assert!(matches!(err, FlowError::ModelUnavailable(_)));
    assert_eq!(coder.calls(), 1);
    assert_eq!(backend.exec_count(), 0);
}

#[derive(Debug)]
struct StalledGenerator;

#[async_trait]
impl CodeGenerator for StalledGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(SUM_A.to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn generation_timeout_means_model_unavailable() {
    let backend = MockBackend::new();
    let config = fast_config().with_generation_timeout(Duration::from_secs(5));
    let flow = flow(&backend, config, Arc::new(StalledGenerator)).await;

    let err = flow.run(request("Sum column A", dataset_a())).await.unwrap_err();
    assert!(matches!(err, FlowError::ModelUnavailable(ref msg) if msg.contains("timed out")));
}

#[tokio::test(start_paused = true)]
async fn cancellation_reaches_the_sandbox() {
    let backend = MockBackend::new().with_exec_delay(Duration::from_secs(60));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = flow(&backend, fast_config(), coder).await;
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        })
    };
    let err = flow
        .run_cancellable(request("Sum column A", dataset_a()), &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, FlowError::Cancelled));
    assert_eq!(backend.exec_count(), 1);
    for _ in 0..50 {
        if backend.removed().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.removed().len(), 1);
    assert!(flow.memory().is_empty().await);
}

#[tokio::test]
async fn successful_runs_survive_restart_and_feed_planning_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory").join("memory.json");
    let backend = MockBackend::new().with_responder(summing_responder);

    {
        let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let memory = Arc::new(WorkingMemory::open(store).await.unwrap());
        let coder = Arc::new(ScriptedGenerator::new(["1. Sum column A", SUM_A]));
        let flow = ScientificFlow::new(FlowConfig::default(), coder, pool_for(&backend).await, memory);
        flow.run(request("Sum column A", dataset_a())).await.unwrap();
    }

    let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
    assert_eq!(store.load().await.unwrap().len(), 1);

    let memory = Arc::new(WorkingMemory::open(store).await.unwrap());
    let planner = Arc::new(ScriptedGenerator::new(["1. Sum again"]));
    let coder = Arc::new(ScriptedGenerator::new([SUM_A]));
    let flow = ScientificFlow::new(FlowConfig::default(), coder, pool_for(&backend).await, memory)
        .with_planner(planner.clone());
    flow.run(request("Sum column A once more", dataset_a())).await.unwrap();

    let prompt = &planner.prompts()[0];
    assert!(prompt.contains("--- Past Interaction Context ---"));
    assert!(prompt.contains("Previous Request: Sum column A"));
    assert_eq!(flow.memory().len().await, 2);
}

#[test]
fn retry_path_is_a_valid_state_sequence() {
    let mut machine = sciflow_core::FlowMachine::new();
    machine.advance(FlowState::Executing).unwrap();
    machine.advance(FlowState::Retry).unwrap();
    machine.advance(FlowState::Executing).unwrap();
    machine.advance(FlowState::Guarded).unwrap();
    assert!(machine.state().is_terminal());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_attempts_are_bounded(failures in 0usize..6, max_retries in 0u32..4) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let backend = MockBackend::new();
            let coder = Arc::new(ScriptedGenerator::failing_then_ok(failures));
            let config = fast_config().with_max_retries(max_retries);
            let flow = flow(&backend, config, coder.clone()).await;

            let response = flow.run(request("Mean of A", dataset_a())).await.unwrap();
            let expected = (failures + 1).min(max_retries as usize + 1);
            prop_assert_eq!(response.attempts.len(), expected);
            prop_assert_eq!(coder.calls(), expected);
            prop_assert_eq!(flow.pool().warm_count().await, 1);
            prop_assert_eq!(flow.memory().len().await, usize::from(failures <= max_retries as usize));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
