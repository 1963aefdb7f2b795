//! Crash recovery: a runtime picking up a half-finished instance resumes
//! from persisted history without re-running completed work, and a
//! filesystem-backed store survives a process restart.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use quorumflow::providers::fs::FsHistoryStore;
use quorumflow::providers::in_memory::InMemoryHistoryStore;
use quorumflow::providers::{HistoryStore, QueueKind, WorkItem};
use quorumflow::quorum::{self, QUORUM_ORCHESTRATION};
use quorumflow::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use quorumflow::runtime::{InstanceStatus, Runtime};
use quorumflow::{Client, Event};

use common::{Behavior, CountingActivity};

#[tokio::test]
async fn resume_replays_history_instead_of_rerunning_completed_solvers() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let prompt = "What is 2+2?";
    let instance = "recovered-quorum";

    // State a crashed runtime would have left behind: all three solvers
    // scheduled, two already completed, and the third solver's completion
    // still sitting in the orchestrator queue.
    store.create_instance(instance).await.unwrap();
    store
        .append(
            instance,
            vec![
                Event::OrchestratorStarted {
                    name: QUORUM_ORCHESTRATION.into(),
                    input: prompt.into(),
                },
                Event::TaskScheduled {
                    id: 1,
                    name: "solver-a".into(),
                    input: prompt.into(),
                },
                Event::TaskScheduled {
                    id: 2,
                    name: "solver-b".into(),
                    input: prompt.into(),
                },
                Event::TaskScheduled {
                    id: 3,
                    name: "solver-c".into(),
                    input: prompt.into(),
                },
                Event::TaskCompleted {
                    id: 1,
                    result: "4".into(),
                },
                Event::TaskCompleted {
                    id: 2,
                    result: "four".into(),
                },
            ],
        )
        .await
        .unwrap();
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::ActivityCompleted {
                instance: instance.into(),
                id: 3,
                result: "2+2=4".into(),
            },
        )
        .await
        .unwrap();

    let (solver, solver_calls) = CountingActivity::new(Behavior::AlwaysOk("stale".into()));
    let (judge, judge_calls) = CountingActivity::new(Behavior::AlwaysOk("4".into()));
    let mut builder = ActivityRegistryBuilder::new();
    for name in quorum::SOLVER_ACTIVITIES {
        builder = builder.register_handler(name, solver.clone());
    }
    let activities = builder
        .register_handler(quorum::JUDGE_ACTIVITY, judge)
        .build();
    let orchestrations = OrchestrationRegistryBuilder::new()
        .register(QUORUM_ORCHESTRATION, quorum::quorum_orchestration)
        .build();

    let runtime = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store);

    let status = client
        .wait_for_completion(instance, Duration::from_secs(10))
        .await
        .unwrap();
    runtime.shutdown().await;

    assert_eq!(
        status,
        InstanceStatus::Completed {
            output: "4".into()
        }
    );
    assert_eq!(
        solver_calls.load(Ordering::SeqCst),
        0,
        "completed solvers must come from history, not re-execution"
    );
    assert_eq!(judge_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fs_store_redelivers_unacked_items_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let item = WorkItem::StartOrchestration {
        instance: "interrupted".into(),
        orchestration: QUORUM_ORCHESTRATION.into(),
        input: "q".into(),
    };

    {
        let store = FsHistoryStore::new(dir.path(), true);
        store
            .enqueue_work(QueueKind::Orchestrator, item.clone())
            .await
            .unwrap();
        let (got, _token) = store
            .dequeue_peek_lock(QueueKind::Orchestrator)
            .await
            .unwrap();
        assert_eq!(got, item);
        // Crash before ack: the token is never settled.
    }

    let store = FsHistoryStore::new(dir.path(), false);
    let (redelivered, token) = store
        .dequeue_peek_lock(QueueKind::Orchestrator)
        .await
        .expect("unacked item is requeued on restart");
    assert_eq!(redelivered, item);
    store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn fs_store_preserves_finished_instances_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let instance;

    {
        let store = Arc::new(FsHistoryStore::new(dir.path(), true));
        let activities = ActivityRegistryBuilder::new()
            .register("solver-a", |_| async { Ok("4".to_string()) })
            .register("solver-b", |_| async { Ok("four".to_string()) })
            .register("solver-c", |_| async { Ok("2+2=4".to_string()) })
            .register("judge", |_| async { Ok("4".to_string()) })
            .build();
        let orchestrations = OrchestrationRegistryBuilder::new()
            .register(QUORUM_ORCHESTRATION, quorum::quorum_orchestration)
            .build();

        let runtime =
            Runtime::start_with_store(store.clone(), activities, orchestrations).await;
        let client = Client::new(store);

        instance = client
            .start_new(QUORUM_ORCHESTRATION, "What is 2+2?")
            .await
            .unwrap();
        let status = client
            .wait_for_completion(&instance, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(status, InstanceStatus::Completed { .. }));
        runtime.shutdown().await;
    }

    // "Restart": a fresh store over the same directory, no runtime needed.
    let store = Arc::new(FsHistoryStore::new(dir.path(), false));
    let client = Client::new(store.clone());

    assert_eq!(
        client.get_status(&instance).await,
        InstanceStatus::Completed {
            output: "4".into()
        }
    );
    let history = client.read_history(&instance).await;
    assert!(history.iter().any(|e| matches!(
        e,
        Event::TaskScheduled { name, .. } if name == "judge"
    )));
    assert!(store.list_instances().await.contains(&instance));
}
