//! End-to-end job scenarios: submit through the queue, run on the worker
//! pool against a scripted remote, observe through the job store.

mod common;

use std::time::Duration;

use clientnotes::broadcast::{JobStatus, JobUpdate, StoreError};
use clientnotes::remote::{RemoteError, Script};
use common::{display_name, script_with_clients, wait_until, TestHarness};

#[test]
fn partial_enrichment_failures_still_complete() {
    let script = script_with_clients(12)
        .failing_lookup(&display_name(3))
        .failing_lookup(&display_name(9));
    let harness = TestHarness::new(script);

    let id = harness.submit(0);
    let job = harness.wait_for_terminal(id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.total, 12);
    assert_eq!(job.counters.processed, 10);
    assert_eq!(job.counters.failed, 2);
    let artifact = job.artifact.expect("completed job has an artifact");
    assert!(artifact.path.starts_with(harness.output_dir.join(id.to_string())));
    assert_eq!(harness.store.artifact_path(id).unwrap(), artifact.path);

    let messages: Vec<&str> = job.logs.iter().map(|l| l.message.as_str()).collect();
    assert!(messages
        .iter()
        .any(|m| m.starts_with("[3/12] Failed to process Family03, Client03:")));
    assert!(messages.contains(&"[12/12] Successfully processed Family12, Client12"));
    assert!(messages.contains(&"Remote session closed"));
    // Log sequence numbers are dense and ordered.
    for (idx, entry) in job.logs.iter().enumerate() {
        assert_eq!(entry.seq, idx as u64);
    }
}

#[test]
fn client_limit_caps_total() {
    let harness = TestHarness::new(script_with_clients(12));

    let job = harness.wait_for_terminal(harness.submit(5));

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.total, 5);
    assert_eq!(job.counters.processed, 5);
    assert_eq!(harness.script().lookups(), 5);
}

#[test]
fn login_retries_are_bounded() {
    let harness = TestHarness::new(script_with_clients(3).failing_logins(u32::MAX));

    let id = harness.submit(0);
    let job = harness.wait_for_terminal(id);

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(harness.script().logins(), 3);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("authentication failed"));
    assert!(job.artifact.is_none());
    assert!(matches!(
        harness.store.artifact_path(id),
        Err(StoreError::NotCompleted { .. })
    ));
    assert!(std::fs::read_dir(&harness.output_dir).unwrap().next().is_none());
}

#[test]
fn busy_workers_leave_extra_jobs_queued() {
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let script = script_with_clients(2).gated_logins(gate_rx);
    let harness = TestHarness::with_workers(script, 2);

    let ids: Vec<_> = (0..3).map(|_| harness.submit(0)).collect();
    wait_until("both workers to start logging in", || {
        harness.script().logins() == 2
    });
    // Give a third worker, if there were one, time to pick up the last job.
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(harness.count_with_status(JobStatus::Queued), 1);
    assert_eq!(harness.count_with_status(JobStatus::Authenticating), 2);
    assert_eq!(harness.pool().active_count(), 2);
    // FIFO: the last submitted job is the one still waiting.
    assert_eq!(harness.store.get(ids[2]).unwrap().status, JobStatus::Queued);

    for _ in 0..3 {
        gate_tx.send(()).unwrap();
    }
    for id in ids {
        assert_eq!(harness.wait_for_terminal(id).status, JobStatus::Completed);
    }
    // Each job opened its own remote session.
    assert_eq!(harness.script().connects(), 3);
    assert_eq!(harness.script().closes(), 3);
}

#[test]
fn fresh_session_is_not_probed() {
    let harness = TestHarness::new(script_with_clients(4));

    let job = harness.wait_for_terminal(harness.submit(0));

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.script().probes(), 0);
}

#[test]
fn malformed_export_fails_conversion() {
    let harness = TestHarness::new(Script::new().with_export("<html><body>Session expired</body></html>"));

    let job = harness.wait_for_terminal(harness.submit(0));

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error_message.unwrap();
    assert!(error.starts_with("conversion failed"), "{}", error);
    assert_eq!(harness.script().lookups(), 0);
}

#[test]
fn fatal_export_error_fails_fast() {
    let harness = TestHarness::new(
        Script::new().export_error(RemoteError::Protocol("unexpected dialog".into())),
    );

    let job = harness.wait_for_terminal(harness.submit(0));

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().starts_with("export failed"));
    assert_eq!(harness.script().exports(), 1);
}

#[test]
fn dead_session_fails_job() {
    let script = script_with_clients(5)
        .losing_session_on_lookup(1)
        .failing_relogins();
    let harness = TestHarness::new(script);

    let job = harness.wait_for_terminal(harness.submit(0));

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error_message.unwrap();
    assert!(error.starts_with("remote session lost"), "{}", error);
    // Initial login plus three re-login attempts.
    assert_eq!(harness.script().logins(), 4);
    assert_eq!(job.counters.processed + job.counters.failed, 0);
    assert!(job.artifact.is_none());
}

#[test]
fn worker_panic_is_captured() {
    let script = script_with_clients(2).panicking_lookup(&display_name(2));
    let harness = TestHarness::new(script);

    let job = harness.wait_for_terminal(harness.submit(0));

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error_message.unwrap();
    assert!(error.starts_with("worker crashed:"), "{}", error);
    assert_eq!(job.counters.processed, 1);
    assert_eq!(
        job.logs.last().map(|l| l.message.as_str()),
        Some(format!("Job failed: {}", error).as_str())
    );
    // The panicking session was still closed.
    assert_eq!(harness.script().closes(), 1);
}

#[test]
fn late_subscriber_sees_every_later_event_once_in_order() {
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let harness = TestHarness::new(script_with_clients(6).gated_logins(gate_rx));

    let id = harness.submit(0);
    wait_until("login to start", || harness.script().logins() == 1);

    let subscription = harness.store.subscribe(id).unwrap();
    assert_eq!(subscription.snapshot.status, JobStatus::Authenticating);
    let already_logged = subscription.snapshot.logs.len() as u64;

    gate_tx.send(()).unwrap();
    let events: Vec<_> = subscription.receiver.iter().collect();

    let log_seqs: Vec<u64> = events
        .iter()
        .filter_map(|e| match &e.update {
            JobUpdate::Log { entry } => Some(entry.seq),
            _ => None,
        })
        .collect();
    let expected: Vec<u64> = (already_logged..already_logged + log_seqs.len() as u64).collect();
    assert_eq!(log_seqs, expected);

    let statuses: Vec<JobStatus> = events
        .iter()
        .filter_map(|e| match &e.update {
            JobUpdate::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Exporting,
            JobStatus::Converting,
            JobStatus::Enriching,
            JobStatus::Generating,
            JobStatus::Completed,
        ]
    );
    assert!(events.last().unwrap().is_terminal());

    // The stream and the stored log agree.
    let job = harness.store.get(id).unwrap();
    assert_eq!(job.logs.len() as u64, already_logged + log_seqs.len() as u64);
}

#[test]
fn snapshot_and_stream_together_cover_every_log_line() {
    let harness = TestHarness::new(script_with_clients(3));

    let id = harness.submit(0);
    let subscription = harness.store.subscribe(id).unwrap();
    let mut seen: Vec<String> = subscription
        .snapshot
        .logs
        .iter()
        .map(|l| l.message.clone())
        .collect();
    seen.extend(subscription.receiver.iter().filter_map(|e| match e.update {
        JobUpdate::Log { entry } => Some(entry.message),
        _ => None,
    }));

    let job = harness.store.get(id).unwrap();
    let stored: Vec<String> = job.logs.iter().map(|l| l.message.clone()).collect();
    assert_eq!(seen, stored);
    assert_eq!(seen.first().map(String::as_str), Some("Logging in to remote system"));
}

#[test]
fn finished_job_subscription_closes_immediately() {
    let harness = TestHarness::new(script_with_clients(1));
    let id = harness.submit(0);
    harness.wait_for_terminal(id);

    let subscription = harness.store.subscribe(id).unwrap();
    assert_eq!(subscription.snapshot.status, JobStatus::Completed);
    assert!(subscription.receiver.recv().is_err());
}

#[test]
fn logs_since_pages_through_history() {
    let harness = TestHarness::new(script_with_clients(3));
    let id = harness.submit(0);
    let job = harness.wait_for_terminal(id);

    let tail = harness.store.logs_since(id, 2).unwrap();
    assert_eq!(tail.len(), job.logs.len() - 2);
    assert_eq!(tail[0], job.logs[2]);
    assert!(harness
        .store
        .logs_since(id, job.logs.len() as u64)
        .unwrap()
        .is_empty());
}

#[test]
fn dashboard_feed_mirrors_terminal_event() {
    let harness = TestHarness::new(script_with_clients(2));
    let mut feed = harness.store.feed();

    let id = harness.submit(0);
    harness.wait_for_terminal(id);

    let mut saw_completed = false;
    while let Ok(event) = feed.try_recv() {
        if event.job_id == id && event.is_terminal() {
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}
