//! End-to-end demo: run the quorum workflow against canned model backends
//! with an in-memory provider and print the judge's verdict.

use std::sync::Arc;

use async_trait::async_trait;

use quorumflow::providers::in_memory::InMemoryHistoryStore;
use quorumflow::quorum::{
    self, ModelConnector, ModelSession, QUORUM_ORCHESTRATION,
};
use quorumflow::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use quorumflow::runtime::Runtime;
use quorumflow::Client;

struct CannedSession(&'static str);

#[async_trait]
impl ModelSession for CannedSession {
    async fn generate(&self, _system: &str, prompt: &str) -> Result<String, String> {
        // The "judge" connector echoes the first candidate line; the solver
        // connector answers with its canned text.
        if prompt.contains("Candidate answers:") {
            let answer = prompt
                .lines()
                .find_map(|l| l.strip_prefix("1. "))
                .unwrap_or(self.0);
            Ok(answer.to_string())
        } else {
            Ok(self.0.to_string())
        }
    }
}

struct CannedConnector(&'static str);

#[async_trait]
impl ModelConnector for CannedConnector {
    async fn connect(&self) -> Result<Box<dyn ModelSession>, String> {
        Ok(Box::new(CannedSession(self.0)))
    }
}

#[tokio::main]
async fn main() {
    let store = Arc::new(InMemoryHistoryStore::default());

    let activities = quorum::register_activities(
        ActivityRegistryBuilder::new(),
        Arc::new(CannedConnector("42")),
        Arc::new(CannedConnector("judge")),
    )
    .build();
    let orchestrations = OrchestrationRegistryBuilder::new()
        .register(QUORUM_ORCHESTRATION, quorum::quorum_orchestration)
        .build();

    let runtime = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store);

    let prompt = std::env::args().nth(1).unwrap_or_else(|| {
        "What is the answer to life, the universe and everything?".to_string()
    });
    let instance = client
        .start_new(QUORUM_ORCHESTRATION, prompt.clone())
        .await
        .expect("start instance");

    let status = client
        .wait_for_completion(&instance, std::time::Duration::from_secs(30))
        .await
        .expect("wait for completion");

    println!("prompt:   {prompt}");
    println!("instance: {instance}");
    println!("status:   {status:?}");

    runtime.shutdown().await;
}
