//! Replay determinism: re-running an orchestration over any prefix of its
//! history schedules nothing new, and poking a finished instance changes
//! nothing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use quorumflow::providers::in_memory::InMemoryHistoryStore;
use quorumflow::quorum::{self, QUORUM_ORCHESTRATION};
use quorumflow::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use quorumflow::runtime::{InstanceStatus, Runtime};
use quorumflow::{run_turn, Client, Event};

fn solver_registry() -> ActivityRegistryBuilder {
    ActivityRegistryBuilder::new()
        .register("solver-a", |_| async { Ok("4".to_string()) })
        .register("solver-b", |_| async { Ok("four".to_string()) })
        .register("solver-c", |_| async { Ok("2+2=4".to_string()) })
        .register("judge", |_| async { Ok("4".to_string()) })
}

async fn run_quorum_to_completion() -> (Vec<Event>, InstanceStatus) {
    let store = Arc::new(InMemoryHistoryStore::new());
    let orchestrations = OrchestrationRegistryBuilder::new()
        .register(QUORUM_ORCHESTRATION, quorum::quorum_orchestration)
        .build();
    let runtime =
        Runtime::start_with_store(store.clone(), solver_registry().build(), orchestrations).await;
    let client = Client::new(store);

    let instance = client
        .start_new(QUORUM_ORCHESTRATION, "What is 2+2?")
        .await
        .unwrap();
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    let history = client.read_history(&instance).await;
    runtime.shutdown().await;
    (history, status)
}

#[tokio::test]
async fn replaying_any_history_prefix_schedules_nothing_new() {
    let (history, status) = run_quorum_to_completion().await;
    assert!(matches!(status, InstanceStatus::Completed { .. }));

    // A replay over a prefix may only re-emit what the full run already
    // recorded: every scheduling event in the prefix is adopted, not
    // re-issued, and no actions are produced for tasks already in history.
    for cut in 1..=history.len() {
        let prefix = history[..cut].to_vec();
        let turn = run_turn(prefix, |ctx| {
            quorum::quorum_orchestration(ctx, "What is 2+2?".into())
        });
        // New scheduling events may only cover tasks the prefix has not
        // yet scheduled.
        for event in &turn.history_delta {
            if let Event::TaskScheduled { id, .. } = event {
                assert!(
                    !history[..cut].iter().any(|e| matches!(
                        e,
                        Event::TaskScheduled { id: hid, .. } if hid == id
                    )),
                    "task {id} scheduled twice"
                );
            }
        }
    }

    // Over the complete history the replay is a pure read: no delta, no
    // actions, and the recorded output is reproduced.
    let output = history.iter().find_map(|e| match e {
        Event::OrchestratorCompleted { output } => Some(output.clone()),
        _ => None,
    });
    let turn = run_turn(history, |ctx| {
        quorum::quorum_orchestration(ctx, "What is 2+2?".into())
    });
    assert!(turn.history_delta.is_empty());
    assert!(turn.actions.is_empty());
    assert_eq!(turn.output, Some(Ok(output.unwrap())));
}

#[tokio::test]
async fn poking_a_terminal_instance_changes_nothing() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let orchestrations = OrchestrationRegistryBuilder::new()
        .register(QUORUM_ORCHESTRATION, quorum::quorum_orchestration)
        .build();
    let runtime =
        Runtime::start_with_store(store.clone(), solver_registry().build(), orchestrations).await;
    let client = Client::new(store.clone());

    let instance = client
        .start_new(QUORUM_ORCHESTRATION, "What is 2+2?")
        .await
        .unwrap();
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    let before = client.read_history(&instance).await;

    // A duplicate start for the finished instance is dropped by the runtime.
    client
        .start_new_with_id(&instance, QUORUM_ORCHESTRATION, "What is 2+2?")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = client.read_history(&instance).await;
    runtime.shutdown().await;

    assert_eq!(before, after);
    assert_eq!(client.get_status(&instance).await, status);
}

#[test]
fn schedule_order_change_is_rejected_not_silently_absorbed() {
    // History recorded for a different schedule order than the code now
    // produces; the replay must refuse to continue.
    let history = vec![
        Event::OrchestratorStarted {
            name: QUORUM_ORCHESTRATION.into(),
            input: "q".into(),
        },
        Event::TaskScheduled {
            id: 1,
            name: "solver-c".into(),
            input: "q".into(),
        },
    ];
    let turn = run_turn(history, |ctx| {
        quorum::quorum_orchestration(ctx, "q".into())
    });
    let output = turn.output.expect("terminal");
    let err = output.expect_err("nondeterminism is an error");
    assert!(err.starts_with("nondeterministic:"), "{err}");
    assert!(turn.history_delta.is_empty());
    assert!(turn.actions.is_empty());
}
