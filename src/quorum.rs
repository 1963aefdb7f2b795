//! Multi-model quorum workflow: fan a prompt out to three solver models in
//! parallel, then hand every proposal to a judge model for a final verdict.
//!
//! Model access goes through [`ModelConnector`]; each activity invocation
//! acquires its own session and drops it when the call returns, so a broken
//! backend never leaks into later attempts or other activities. All
//! model-facing I/O lives in activities; the orchestration itself only
//! schedules tasks and shapes their inputs and outputs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::runtime::registry::{ActivityHandler, ActivityRegistryBuilder};
use crate::{OrchestrationContext, RetryPolicy};

/// Orchestration name the quorum workflow registers under.
pub const QUORUM_ORCHESTRATION: &str = "quorum";

/// Solver activity names, in the order their proposals are numbered.
pub const SOLVER_ACTIVITIES: [&str; 3] = ["solver-a", "solver-b", "solver-c"];

/// Judge activity name.
pub const JUDGE_ACTIVITY: &str = "judge";

fn model_call_policy() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_millis(2000))
}

/// One-shot session against a model backend.
#[async_trait]
pub trait ModelSession: Send + Sync {
    /// Generate a completion for `prompt` under the given system instruction.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, String>;
}

/// Factory for model sessions. Connectors are long-lived and shared across
/// activities; sessions are acquired per invocation and scoped to it.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ModelSession>, String>;
}

/// Activity that asks one solver model for an answer proposal.
pub struct SolverActivity {
    connector: Arc<dyn ModelConnector>,
    system_prompt: String,
}

impl SolverActivity {
    pub fn new(connector: Arc<dyn ModelConnector>, system_prompt: impl Into<String>) -> Self {
        Self {
            connector,
            system_prompt: system_prompt.into(),
        }
    }
}

#[async_trait]
impl ActivityHandler for SolverActivity {
    async fn invoke(&self, input: String) -> Result<String, String> {
        let session = self.connector.connect().await?;
        session.generate(&self.system_prompt, &input).await
    }
}

/// Activity that picks the best proposal. Its input is a JSON array of two
/// strings: the numbered proposal list and the original prompt.
pub struct JudgeActivity {
    connector: Arc<dyn ModelConnector>,
    system_prompt: String,
}

impl JudgeActivity {
    pub fn new(connector: Arc<dyn ModelConnector>, system_prompt: impl Into<String>) -> Self {
        Self {
            connector,
            system_prompt: system_prompt.into(),
        }
    }
}

#[async_trait]
impl ActivityHandler for JudgeActivity {
    async fn invoke(&self, input: String) -> Result<String, String> {
        let (proposals, prompt) = decode_judge_input(&input)?;
        let session = self.connector.connect().await?;
        let prompt = format!(
            "Question:\n{prompt}\n\nCandidate answers:\n{proposals}\n\nPick the best answer."
        );
        session.generate(&self.system_prompt, &prompt).await
    }
}

/// Wire format between the orchestration and the judge activity.
pub fn encode_judge_input(proposals: &str, prompt: &str) -> Result<String, String> {
    serde_json::to_string(&[proposals, prompt])
        .map_err(|e| format!("encode judge input: {e}"))
}

pub fn decode_judge_input(input: &str) -> Result<(String, String), String> {
    let parts: [String; 2] =
        serde_json::from_str(input).map_err(|e| format!("decode judge input: {e}"))?;
    let [proposals, prompt] = parts;
    Ok((proposals, prompt))
}

/// Register the three solver activities and the judge against one connector
/// per role. Solvers share `solver_connector`; the judge gets its own.
pub fn register_activities(
    builder: ActivityRegistryBuilder,
    solver_connector: Arc<dyn ModelConnector>,
    judge_connector: Arc<dyn ModelConnector>,
) -> ActivityRegistryBuilder {
    let mut builder = builder;
    for name in SOLVER_ACTIVITIES {
        builder = builder.register_handler(
            name,
            Arc::new(SolverActivity::new(
                solver_connector.clone(),
                "Answer the question concisely and correctly.",
            )),
        );
    }
    builder.register_handler(
        JUDGE_ACTIVITY,
        Arc::new(JudgeActivity::new(
            judge_connector,
            "You are a strict judge. Reply with the single best answer, verbatim.",
        )),
    )
}

/// The quorum orchestration: validate, fan out, join, judge.
///
/// An empty prompt fails the instance before any task is scheduled. The join
/// is all-or-nothing: if any solver exhausts its retries the instance fails
/// and the judge is never scheduled. Proposals reaching the judge are
/// numbered in scheduling order, which replay keeps stable across runs.
pub async fn quorum_orchestration(
    ctx: OrchestrationContext,
    input: String,
) -> Result<String, String> {
    if input.trim().is_empty() {
        return Err("prompt must not be empty".to_string());
    }

    let policy = model_call_policy();
    let solvers = SOLVER_ACTIVITIES
        .iter()
        .map(|name| ctx.schedule_task_with_retry(*name, &input, policy.clone()))
        .collect();
    let results = ctx.join(solvers).await;

    let mut proposals = Vec::with_capacity(results.len());
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(text) => proposals.push(format!("{}. {}", i + 1, text)),
            Err(error) => {
                return Err(format!("solver {} failed: {error}", SOLVER_ACTIVITIES[i]));
            }
        }
    }
    let numbered = proposals.join("\n");
    debug!(proposals = proposals.len(), "solvers done, scheduling judge");

    let judge_input = encode_judge_input(&numbered, &input)?;
    ctx.schedule_task_with_retry(JUDGE_ACTIVITY, judge_input, model_call_policy())
        .await
}
