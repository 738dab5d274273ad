//! Scientific flow orchestrator
//!
//! Turns one request into a verified, bounded side effect:
//! - Plan via cache-or-generate, or stop at the planning checkpoint
//! - Generate and run code, feeding each failure into the next attempt
//! - Guardrail scan, evaluation and council review of a successful run
//! - Persist the interaction to working memory
//!
//! Every collaborator is injected; nothing here is a process singleton.

use crate::config::{CacheKeyMode, FlowConfig};
use crate::error::FlowError;
use crate::extract::{extract_code, split_thought};
use crate::generator::CodeGenerator;
use crate::prompts;
use crate::state::{FlowMachine, FlowState};
use crate::types::{ExecutionAttempt, FlowMode, FlowRequest, FlowResponse, FlowStatus};
use sciflow_memory::{MemoryEntry, PlanCache, PlanKey, WorkingMemory};
use sciflow_review::{Evaluator, GuardrailAgent, TheCouncil};
use sciflow_sandbox::{RunOutcome, SandboxPool};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Plan used when plan generation fails
pub const FALLBACK_PLAN: &str = "Proceed with analysis.";

/// The orchestrator
#[derive(Debug)]
pub struct ScientificFlow {
    config: FlowConfig,
    planner: Arc<dyn CodeGenerator>,
    coder: Arc<dyn CodeGenerator>,
    pool: SandboxPool,
    cache: PlanCache,
    memory: Arc<WorkingMemory>,
    guardrail: GuardrailAgent,
    evaluator: Evaluator,
    council: TheCouncil,
}

impl ScientificFlow {
    /// Create a flow; `coder` also plans unless [`with_planner`](Self::with_planner) is used
    #[must_use]
    pub fn new(
        config: FlowConfig,
        coder: Arc<dyn CodeGenerator>,
        pool: SandboxPool,
        memory: Arc<WorkingMemory>,
    ) -> Self {
        Self {
            cache: PlanCache::new(config.cache_capacity),
            planner: Arc::clone(&coder),
            coder,
            pool,
            memory,
            guardrail: GuardrailAgent::new(),
            evaluator: Evaluator::new(),
            council: TheCouncil::new(),
            config,
        }
    }

    /// With a separate planning model
    #[must_use]
    pub fn with_planner(mut self, planner: Arc<dyn CodeGenerator>) -> Self {
        self.planner = planner;
        self
    }

    /// With a shared plan cache
    #[must_use]
    pub fn with_cache(mut self, cache: PlanCache) -> Self {
        self.cache = cache;
        self
    }

    /// With a custom council
    #[must_use]
    pub fn with_council(mut self, council: TheCouncil) -> Self {
        self.council = council;
        self
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Sandbox pool
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Plan cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Working memory
    #[inline]
    #[must_use]
    pub fn memory(&self) -> &WorkingMemory {
        &self.memory
    }

    /// Handle one request
    ///
    /// # Errors
    /// - `FlowError::ModelUnavailable` if code generation fails or times out
    /// - `FlowError::SandboxUnavailable` if sandboxing is down
    /// - `FlowError::Dataset` if the dataset cannot be serialized
    pub async fn run(&self, request: FlowRequest) -> Result<FlowResponse, FlowError> {
        self.run_cancellable(request, &CancellationToken::new()).await
    }

    /// [`run`](Self::run), abandoned when `token` is cancelled
    ///
    /// Cancellation kills the active sandbox and nothing is persisted.
    ///
    /// # Errors
    /// As [`run`](Self::run), plus `FlowError::Cancelled`.
    #[tracing::instrument(
        skip_all,
        fields(request_id = %request.id, mode = ?request.mode, confirmed = request.is_confirmed_plan)
    )]
    pub async fn run_cancellable(
        &self,
        request: FlowRequest,
        token: &CancellationToken,
    ) -> Result<FlowResponse, FlowError> {
        let started = Instant::now();
        let mut machine = FlowMachine::new();

        let (plan, thought) = if request.is_confirmed_plan {
            (Some(request.instruction.clone()), None)
        } else if self.config.planning_enabled || request.mode == FlowMode::Planning {
            let raw = self.plan(&request, token).await?;
            let (plan, thought) = split_thought(&raw);
            (Some(plan), thought)
        } else {
            (None, None)
        };

        if request.mode == FlowMode::Planning && !request.is_confirmed_plan {
            machine.advance(FlowState::WaitingConfirmation)?;
            let mut response = FlowResponse::new(request.id, FlowStatus::WaitingConfirmation);
            response.result = plan.clone().unwrap_or_default();
            response.plan = plan;
            response.thought = thought;
            tracing::info!(status = %response.status, "plan awaiting confirmation");
            return Ok(response);
        }

        let instruction = match (&plan, request.is_confirmed_plan) {
            (Some(plan), true) => plan.clone(),
            (Some(plan), false) => prompts::augmented_instruction(&request.instruction, plan),
            (None, _) => request.instruction.clone(),
        };

        let mut response = FlowResponse::new(request.id, FlowStatus::Completed);
        response.plan = plan.clone();
        response.thought = thought;

        let success = self
            .execute(&request, &instruction, &mut machine, &mut response, token)
            .await?;
        let Some((code, outcome)) = success else {
            machine.advance(FlowState::Completed)?;
            tracing::warn!(
                attempts = response.attempts.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "all attempts failed"
            );
            return Ok(response);
        };

        let verdict = self.guardrail.scan(&code);
        if !verdict.safe {
            machine.advance(FlowState::Guarded)?;
            tracing::warn!(reason = %verdict.reason, "script rejected by guardrail");
            response.result.clone_from(&verdict.reason);
            response.code = String::new();
            response.image = None;
            if let Some(last) = response.attempts.last_mut() {
                last.code.clear();
                last.output.clear();
                last.image = None;
            }
            response.guardrail = Some(verdict);
            return Ok(response);
        }
        response.guardrail = Some(verdict);

        let mut result = outcome.output;
        let quality = self.evaluator.evaluate_code_quality(&code);
        if !quality.is_clean() {
            tracing::warn!(issues = ?quality.issues, "code quality issues");
        }
        let evaluation = self.evaluator.score_execution(&result, None);
        tracing::debug!(score = evaluation.score, status = %evaluation.status, "result evaluated");

        let plan_text = plan.as_deref().unwrap_or_default();
        let verdict = self.council.adjudicate(plan_text, &code, &result);
        if let Some(plan) = plan.as_deref() {
            let alignment = self.guardrail.audit_alignment(plan, &code);
            if !alignment.safe {
                let _ = write!(result, "\n\n[Warning] {}", alignment.reason);
            }
        }
        if let Some(summary) = verdict.summary() {
            result.push_str("\n\n");
            result.push_str(&summary);
        }
        machine.advance(FlowState::Completed)?;

        let meta = request
            .catalog
            .clone()
            .unwrap_or_else(|| default_meta(request.dataset.columns(), request.dataset.shape()));
        let entry = MemoryEntry::new(&request.instruction, plan_text, &code, &result).with_meta(meta);
        if let Err(e) = self.memory.append(entry).await {
            tracing::error!(error = %e, "failed to persist interaction");
            let _ = write!(result, "\n\n[Note] Interaction was not saved to memory: {e}");
        }

        response.result = result;
        response.code = code;
        response.image = outcome.image;
        response.evaluation = Some(evaluation);
        response.reviews = verdict.reviews;
        tracing::info!(
            status = %response.status,
            attempts = response.attempts.len(),
            has_image = response.image.is_some(),
            duration_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        Ok(response)
    }

    /// Cached plan or a freshly generated one; falls back on model failure
    async fn plan(&self, request: &FlowRequest, token: &CancellationToken) -> Result<String, FlowError> {
        let key = self.plan_key(request);
        let generated = self
            .cache
            .try_get_or_insert_with(key, || async {
                let context = self.memory.context_for(&request.instruction).await;
                let prompt =
                    prompts::planning_prompt(&request.instruction, &request.dataset, &context);
                self.generate(self.planner.as_ref(), &prompt, token).await
            })
            .await;
        match generated {
            Ok(plan) => Ok(plan),
            Err(e) if matches!(*e, FlowError::Cancelled) => Err(FlowError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "planning failed, using fallback plan");
                Ok(FALLBACK_PLAN.to_string())
            }
        }
    }

    fn plan_key(&self, request: &FlowRequest) -> PlanKey {
        let dataset = &request.dataset;
        match self.config.cache_key_mode {
            CacheKeyMode::Shape => PlanKey::new(&request.instruction, dataset.columns(), dataset.shape()),
            CacheKeyMode::Content => PlanKey::with_content(
                &request.instruction,
                dataset.columns(),
                dataset.shape(),
                &dataset.content_digest(),
            ),
        }
    }

    /// Bounded retry loop; returns the successful code and outcome, if any
    ///
    /// Every attempt is recorded on `response`. When all attempts fail the
    /// response carries the last error and code.
    async fn execute(
        &self,
        request: &FlowRequest,
        instruction: &str,
        machine: &mut FlowMachine,
        response: &mut FlowResponse,
        token: &CancellationToken,
    ) -> Result<Option<(String, RunOutcome)>, FlowError> {
        machine.advance(FlowState::Executing)?;
        let dataset = request.dataset.to_csv_bytes()?;
        let max_attempts = self.config.max_attempts();
        let mut previous_error: Option<String> = None;

        for number in 1..=max_attempts {
            if machine.state() == FlowState::Retry {
                machine.advance(FlowState::Executing)?;
            }
            let prompt = prompts::code_prompt(instruction, &request.dataset, previous_error.as_deref());
            let raw = self.generate(self.coder.as_ref(), &prompt, token).await?;
            let code = extract_code(&raw);

            let outcome = self
                .pool
                .run_cancellable(&code, &dataset, self.config.execution_timeout(), token)
                .await?;
            let error = outcome.error_text();
            response.attempts.push(ExecutionAttempt {
                number,
                code: code.clone(),
                output: outcome.output.clone(),
                image: outcome.image.clone(),
                error: error.clone(),
            });

            let Some(error) = error else {
                tracing::info!(attempt = number, "attempt succeeded");
                return Ok(Some((code, outcome)));
            };
            tracing::warn!(attempt = number, max_attempts, error = %error, "attempt failed");
            response.result.clone_from(&error);
            response.code = code;
            previous_error = Some(error);
            if number < max_attempts {
                machine.advance(FlowState::Retry)?;
            }
        }
        Ok(None)
    }

    /// One generation call bounded by the configured timeout
    async fn generate(
        &self,
        generator: &dyn CodeGenerator,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<String, FlowError> {
        let deadline = self.config.generation_timeout();
        tokio::select! {
            biased;
            () = token.cancelled() => Err(FlowError::Cancelled),
            res = tokio::time::timeout(deadline, generator.generate(prompt)) => match res {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(FlowError::ModelUnavailable(format!(
                    "generation timed out after {}s",
                    deadline.as_secs()
                ))),
            },
        }
    }
}

/// Metadata stored with an interaction when no catalog was supplied
#[must_use]
pub fn default_meta(columns: &[String], shape: (usize, usize)) -> Value {
    json!({ "columns": columns, "shape": [shape.0, shape.1] })
}
