//! Durability tests: requests survive a coordinator restart and resume
//! from their journaled state, and retention sweeps remove retired
//! records and their artifacts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use forgeline::{Coordinator, Dispatcher, Journal, PipelineConfig};
use forgeline_protocol::{
    state, RequestId, RequestState, SourceRef, SubmissionDoc, Verdict,
};
use forgeline_worker::{ScriptedTestDriver, ScriptedToolchain};

fn fast_config(tmp: &tempfile::TempDir) -> PipelineConfig {
    PipelineConfig {
        data_root: tmp.path().to_path_buf(),
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(10),
        ..PipelineConfig::default()
    }
}

fn doc() -> SubmissionDoc {
    SubmissionDoc::new(
        "client-1",
        vec![SourceRef {
            name: "a.src".to_string(),
            content: "fn a()\n".to_string(),
        }],
        "assert-entry-count 1",
        "debug",
    )
}

fn wait_for(dispatcher: &Dispatcher, request_id: &RequestId, target: RequestState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = dispatcher.status(request_id).unwrap();
        if snapshot.state == target {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, last state {:?}",
            target,
            snapshot.state
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_queued_request_completes_after_restart() {
    let tmp = tempfile::tempdir().unwrap();

    // First process: accept the submission but never start the pools, as
    // if the process died right after accepting.
    let request_id = {
        let coordinator = Coordinator::new(
            fast_config(&tmp),
            Arc::new(ScriptedToolchain::succeeding()),
            Arc::new(ScriptedTestDriver::passing()),
        )
        .unwrap();
        coordinator.dispatcher().submit(doc()).unwrap()
    };

    // Second process over the same data root recovers and finishes it.
    let mut coordinator = Coordinator::new(
        fast_config(&tmp),
        Arc::new(ScriptedToolchain::succeeding()),
        Arc::new(ScriptedTestDriver::passing()),
    )
    .unwrap();
    coordinator.start();
    let dispatcher = coordinator.dispatcher();

    wait_for(&dispatcher, &request_id, RequestState::Completed);
    let snapshot = dispatcher.status(&request_id).unwrap();
    assert_eq!(snapshot.report.unwrap().verdict, Verdict::Pass);

    coordinator.shutdown();
    coordinator.join();
}

#[test]
fn test_journal_replay_matches_stored_state() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fast_config(&tmp);
    let state_root = config.state_root();

    let mut coordinator = Coordinator::new(
        config,
        Arc::new(ScriptedToolchain::succeeding()),
        Arc::new(ScriptedTestDriver::passing()),
    )
    .unwrap();
    coordinator.start();
    let dispatcher = coordinator.dispatcher();

    let request_id = dispatcher.submit(doc()).unwrap();
    wait_for(&dispatcher, &request_id, RequestState::Completed);
    coordinator.shutdown();
    coordinator.join();

    // Replaying the transition journal alone reproduces the final state.
    let journal = Journal::open(state_root).unwrap();
    let history = journal.load_history(&request_id).unwrap();
    assert_eq!(history.first().unwrap().state, RequestState::Queued);
    assert_eq!(state::replay(&history).unwrap(), RequestState::Completed);

    let stored = journal.load(&request_id).unwrap();
    assert_eq!(stored.request.state, RequestState::Completed);
    assert!(stored.report.is_some());
    assert_eq!(stored.artifacts.len(), 2);
}

#[test]
fn test_retention_sweep_removes_terminal_requests() {
    let tmp = tempfile::tempdir().unwrap();
    // Zero retention retires a request as soon as it goes terminal.
    let config = PipelineConfig {
        retention: Duration::from_secs(0),
        ..fast_config(&tmp)
    };
    let store_root = config.store_root();

    let mut coordinator = Coordinator::new(
        config,
        Arc::new(ScriptedToolchain::succeeding()),
        Arc::new(ScriptedTestDriver::passing()),
    )
    .unwrap();
    coordinator.start();
    let dispatcher = coordinator.dispatcher();

    let request_id = dispatcher.submit(doc()).unwrap();
    wait_for(&dispatcher, &request_id, RequestState::Completed);
    let artifacts = dispatcher.status(&request_id).unwrap().artifacts;
    assert!(!artifacts.is_empty());

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(coordinator.sweep_retired().unwrap(), 1);

    // Record and artifacts are both gone.
    assert!(dispatcher.status(&request_id).is_err());
    let store = forgeline::ArtifactStore::open(store_root).unwrap();
    for artifact in &artifacts {
        assert!(!store.contains(&artifact.content_sha256));
    }

    coordinator.shutdown();
    coordinator.join();
}

#[test]
fn test_in_flight_request_survives_second_restart_generation_fencing() {
    let tmp = tempfile::tempdir().unwrap();

    // Run a request to completion, restart, and submit another; the
    // restarted registry must keep issuing lease generations above
    // anything recorded before the restart.
    let first = {
        let mut coordinator = Coordinator::new(
            fast_config(&tmp),
            Arc::new(ScriptedToolchain::succeeding()),
            Arc::new(ScriptedTestDriver::passing()),
        )
        .unwrap();
        coordinator.start();
        let dispatcher = coordinator.dispatcher();
        let id = dispatcher.submit(doc()).unwrap();
        wait_for(&dispatcher, &id, RequestState::Completed);
        coordinator.shutdown();
        coordinator.join();
        id
    };

    let config = fast_config(&tmp);
    let state_root = config.state_root();
    let mut coordinator = Coordinator::new(
        config,
        Arc::new(ScriptedToolchain::succeeding()),
        Arc::new(ScriptedTestDriver::passing()),
    )
    .unwrap();
    coordinator.start();
    let dispatcher = coordinator.dispatcher();

    // The completed request is untouched by recovery.
    assert_eq!(
        dispatcher.status(&first).unwrap().state,
        RequestState::Completed
    );

    let second = dispatcher.submit(doc()).unwrap();
    wait_for(&dispatcher, &second, RequestState::Completed);
    coordinator.shutdown();
    coordinator.join();

    // Generations in the new request's history are strictly increasing.
    let journal = Journal::open(state_root).unwrap();
    let history = journal.load_history(&second).unwrap();
    let generations: Vec<u64> = history
        .iter()
        .map(|t| t.lease_generation)
        .filter(|g| *g != 0)
        .collect();
    let mut sorted = generations.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(generations, sorted);
}
