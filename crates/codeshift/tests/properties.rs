//! Invariants that must hold across whole job runs: state machine edges,
//! retry budget, progress, log completeness, single terminal commit and the
//! concurrency bound.

mod common;

use std::sync::{Arc, Barrier};

use futures_util::StreamExt;
use tokio::sync::broadcast::error::TryRecvError;

use codeshift::broadcast::{CancelOutcome, JobEventBroadcaster, JobEventKind, TransitionFields};
use codeshift::{Job, JobEvent, JobId, JobStatus, JobStore, JobSubmission, SourceFile, StoreError};
use common::*;

/// Scripts one failure of every loop-back kind.
fn script_bumpy_run(harness: &TestHarness) {
    harness.verifier.script_compile(compile_error("error: cannot find symbol"));
    harness.verifier.script_test(failing_tests("1 test failed"));
    harness.converter.script_review(rejected("use BigDecimal for balances"));
}

fn events_for(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>, id: &JobId) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) if event.job_id == *id => events.push(event),
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            Err(TryRecvError::Lagged(n)) => panic!("event receiver lagged by {}", n),
        }
    }
}

#[tokio::test]
async fn test_every_transition_is_an_edge() {
    let harness = TestHarness::new();
    script_bumpy_run(&harness);
    let mut rx = harness.scheduler.subscribe_events();

    let job = harness.run("ledger").await;
    let events = events_for(&mut rx, &job.id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 3);
    let mut transitions = Vec::new();
    for event in &events {
        match &event.kind {
            JobEventKind::Transitioned { from } => {
                assert!(
                    from.can_transition_to(event.status),
                    "{} -> {} is not an edge",
                    from,
                    event.status
                );
                transitions.push(event.status);
            }
            JobEventKind::Updated => assert!(!event.status.is_terminal()),
            JobEventKind::Created | JobEventKind::CancelRequested => {}
        }
    }
    assert_eq!(
        transitions,
        vec![
            JobStatus::Analyzing,
            JobStatus::Converting,
            JobStatus::Compiling,
            JobStatus::Converting,
            JobStatus::Compiling,
            JobStatus::Testing,
            JobStatus::Converting,
            JobStatus::Compiling,
            JobStatus::Testing,
            JobStatus::Reviewing,
            JobStatus::Converting,
            JobStatus::Compiling,
            JobStatus::Testing,
            JobStatus::Reviewing,
            JobStatus::Completed,
        ]
    );
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_retry_count_never_exceeds_budget() {
    for budget in 0..=3 {
        let harness = TestHarness::with_settings(SettingsBuilder::new().max_retries(budget));
        for _ in 0..10 {
            harness.verifier.script_compile(compile_error("error: incompatible types"));
        }
        let mut rx = harness.scheduler.subscribe_events();

        let job = harness.run("ledger").await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, budget);
        assert_eq!(job.compile_attempts, budget + 1);
        for event in events_for(&mut rx, &job.id) {
            assert!(event.retry_count <= budget);
        }
    }
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let harness = TestHarness::new();
    script_bumpy_run(&harness);
    let id = harness.submit("ledger");
    let updates = harness.scheduler.status_updates(&id).unwrap();

    let statuses: Vec<_> = tokio::time::timeout(WAIT, updates.collect::<Vec<_>>())
        .await
        .expect("Timed out collecting status updates");

    assert_eq!(statuses.first().map(|s| s.status), Some(JobStatus::Pending));
    assert_eq!(statuses.last().map(|s| s.status), Some(JobStatus::Completed));
    for pair in statuses.windows(2) {
        assert!(
            pair[0].progress_percent <= pair[1].progress_percent,
            "progress went from {} to {}",
            pair[0].progress_percent,
            pair[1].progress_percent
        );
    }
}

#[tokio::test]
async fn test_log_snapshot_and_chunks_cover_everything() {
    let harness = TestHarness::new();
    script_bumpy_run(&harness);
    let gate = harness.converter.gate_analyze();
    let id = harness.submit("ledger");
    gate.wait_entered().await;

    let before = harness.scheduler.log_snapshot(&id).unwrap();
    let subscription = harness.scheduler.subscribe_logs(&id).unwrap();
    gate.open();
    let items = drain(subscription).await;

    assert_eq!(items[0].text(), before);
    let log = harness.scheduler.log_snapshot(&id).unwrap();
    assert_eq!(text_of(&items), log);

    let seqs: Vec<u64> = items
        .iter()
        .filter_map(|item| match item {
            codeshift::LogItem::Chunk(chunk) => Some(chunk.seq),
            _ => None,
        })
        .collect();
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn test_concurrency_bound_holds() {
    let harness = TestHarness::with_settings(SettingsBuilder::new().max_concurrent_jobs(2));
    let mut rx = harness.scheduler.subscribe_events();
    let ids: Vec<JobId> = (0..5).map(|n| harness.submit(&format!("batch-{}", n))).collect();

    let mut finished = 0;
    while finished < ids.len() {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for events")
            .expect("Event channel closed");
        assert!(harness.scheduler.counts().active.len() <= 2);
        if event.is_terminal() {
            finished += 1;
        }
    }

    let counts = harness.scheduler.counts();
    assert_eq!(counts.count(JobStatus::Completed), 5);
    assert!(counts.active.is_empty());
}

fn reviewing_job(store: &JobStore) -> JobId {
    let job = Job::from_submission(JobSubmission::new(
        "race",
        "java-spring",
        vec![SourceFile::new("race.pc", "")],
    ));
    let id = store.create(job).unwrap();
    let path = [
        JobStatus::Pending,
        JobStatus::Analyzing,
        JobStatus::Converting,
        JobStatus::Compiling,
        JobStatus::Testing,
        JobStatus::Reviewing,
    ];
    for step in path.windows(2) {
        store
            .transition(&id, step[0], step[1], TransitionFields::default())
            .unwrap();
    }
    id
}

#[test]
fn test_only_one_completion_wins() {
    let store = Arc::new(JobStore::new(JobEventBroadcaster::new(64)));
    let id = reviewing_job(&store);
    let mut rx = store.subscribe();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            std::thread::spawn(move || {
                barrier.wait();
                store.transition(
                    &id,
                    JobStatus::Reviewing,
                    JobStatus::Completed,
                    TransitionFields::completed(format!("/out/{}", n)),
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, StoreError::Conflict { .. })));
    let terminal = events_for(&mut rx, &id)
        .into_iter()
        .filter(|e| e.is_terminal())
        .count();
    assert_eq!(terminal, 1);
}

#[test]
fn test_completion_and_cancellation_race() {
    for _ in 0..20 {
        let store = Arc::new(JobStore::new(JobEventBroadcaster::new(64)));
        let id = reviewing_job(&store);
        let mut rx = store.subscribe();
        let barrier = Arc::new(Barrier::new(2));

        let completer = {
            let (store, barrier, id) = (Arc::clone(&store), Arc::clone(&barrier), id.clone());
            std::thread::spawn(move || {
                barrier.wait();
                store.transition(
                    &id,
                    JobStatus::Reviewing,
                    JobStatus::Completed,
                    TransitionFields::completed("/out"),
                )
            })
        };
        let canceller = {
            let (store, barrier, id) = (Arc::clone(&store), Arc::clone(&barrier), id.clone());
            std::thread::spawn(move || {
                barrier.wait();
                store.request_cancel(&id)
            })
        };
        let completed = completer.join().unwrap();
        let cancel = canceller.join().unwrap();

        match (completed, cancel) {
            (Ok(job), Err(StoreError::Terminal { .. })) => {
                assert_eq!(job.status, JobStatus::Completed);
            }
            (Err(StoreError::CancellationPending(_)), Ok(CancelOutcome::Flagged(_))) => {
                let job = store
                    .transition(
                        &id,
                        JobStatus::Reviewing,
                        JobStatus::Cancelled,
                        TransitionFields::default(),
                    )
                    .unwrap();
                assert!(job.output_file_path.is_none());
            }
            (Ok(job), Ok(CancelOutcome::Flagged(_))) => {
                panic!("completed {:?} after cancellation was flagged", job.status)
            }
            other => panic!("unexpected race result: {:?}", other),
        }

        let terminal = events_for(&mut rx, &id)
            .into_iter()
            .filter(|e| e.is_terminal())
            .count();
        assert_eq!(terminal, 1);
    }
}
