//! Scheduling, attempts and hand-off of the connection manager
//!
//! Run with: cargo test -p syncwarden-scheduling --test manager_lifecycle_test

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{idle_record, test_config, Harness, Step};
use syncwarden_durable::InstanceStatus;
use syncwarden_scheduling::activities::{AttemptStatus, ConnectionRecord, JobStatus};
use syncwarden_scheduling::state::{ControllerState, JobInformation, Phase, RunKind};
use syncwarden_scheduling::{
    CarriedState, ConnectionManagerInput, ConnectionSchedule, ConnectionStatus, JobTracker as _,
    ManagerExit, ManagerPhase, TimeUnit,
};
use tokio::time::Instant;
use tokio_test::assert_ok;

// ============================================
// Scheduling
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_never_run_connection_syncs_immediately() {
    let h = Harness::new(ConnectionRecord::new(ConnectionSchedule::every(
        24,
        TimeUnit::Hours,
    )));
    h.start();

    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;
    assert_eq!(jobs[0].kind, RunKind::Sync);
    assert_eq!(jobs[0].status, JobStatus::Succeeded);

    // the next run is a day away
    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    assert_eq!(h.jobs().len(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_scheduled_run_fires_after_time_to_wait() {
    let h = Harness::new(
        ConnectionRecord::new(ConnectionSchedule::every(1, TimeUnit::Hours))
            .with_last_terminal_job_start(Utc::now() - chrono::Duration::minutes(30)),
    );
    h.start();

    tokio::time::sleep(Duration::from_secs(25 * 60)).await;
    assert!(h.jobs().is_empty());

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    let jobs = h.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, RunKind::Sync);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_schedule_failure_falls_back_to_retry_interval() {
    let h = Harness::new(ConnectionRecord::new(ConnectionSchedule::every(
        24,
        TimeUnit::Hours,
    )));
    // two full rounds of the three-attempt activity retry
    h.config.fail_next("get_time_to_wait", 6);
    let started = Instant::now();
    h.start();

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(h.jobs().is_empty());

    h.wait_for_jobs(|jobs| !jobs.is_empty()).await;
    assert!(started.elapsed() >= Duration::from_secs(120));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_disabled_connection_is_not_scheduled() {
    for record in [
        ConnectionRecord::new(ConnectionSchedule::every(1, TimeUnit::Hours)).tombstoned(),
        ConnectionRecord::new(ConnectionSchedule::every(1, TimeUnit::Hours))
            .with_status(ConnectionStatus::Inactive),
    ] {
        let h = Harness::new(record);
        h.start();

        tokio::time::sleep(Duration::from_secs(48 * 60 * 60)).await;
        assert!(h.jobs().is_empty());

        // operators can still run it by hand
        assert_ok!(h.service.submit_manual_sync(h.connection_id));
        let jobs = h
            .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
            .await;
        assert_eq!(jobs.len(), 1);
        h.service.shutdown();
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_reset_and_skip_suppresses_one_scheduled_run() {
    let h = Harness::new(
        ConnectionRecord::new(ConnectionSchedule::every(1, TimeUnit::Hours))
            .with_last_terminal_job_start(Utc::now() - chrono::Duration::minutes(30)),
    );
    h.start();

    assert_ok!(h.service.reset_connection_and_skip_next_scheduling(h.connection_id));
    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;
    assert_eq!(jobs[0].kind, RunKind::Reset);
    assert!(h.snapshot().state.skip_next_scheduling);

    // the run due an hour after the reset is skipped
    tokio::time::sleep(Duration::from_secs(90 * 60)).await;
    assert_eq!(h.jobs().len(), 1);
    assert!(!h.snapshot().state.skip_next_scheduling);

    // the one after that, an hour later, runs
    tokio::time::sleep(Duration::from_secs(35 * 60)).await;
    let jobs = h.wait_for_jobs(|jobs| jobs.len() == 2).await;
    assert_eq!(jobs[1].kind, RunKind::Sync);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_skipped_run_stays_skipped_across_handoffs() {
    let h = Harness::new(idle_record());
    h.start();

    assert_ok!(h.service.reset_connection_and_skip_next_scheduling(h.connection_id));
    h.wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    // reload an hour before the skipped run comes due
    tokio::time::sleep(Duration::from_secs(23 * 60 * 60)).await;
    assert_ok!(h.service.connection_updated(h.connection_id));
    h.wait_for_incarnation(2).await;
    assert!(h.snapshot().state.skip_next_scheduling);

    tokio::time::sleep(Duration::from_secs(6 * 60 * 60)).await;
    assert_eq!(h.jobs().len(), 1);
    assert!(!h.snapshot().state.skip_next_scheduling);

    // reload again while the skipped interval is still open
    assert_ok!(h.service.connection_updated(h.connection_id));
    h.wait_for_incarnation(3).await;

    tokio::time::sleep(Duration::from_secs(18 * 60 * 60)).await;
    assert_eq!(h.jobs().len(), 1);

    // one full interval after the skipped run
    tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
    let jobs = h.wait_for_jobs(|jobs| jobs.len() == 2).await;
    assert_eq!(jobs[1].kind, RunKind::Sync);
    assert!(jobs[1].created_at - jobs[0].created_at > chrono::Duration::hours(47));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_skip_survives_schedule_lookup_failure() {
    let h = Harness::new(
        ConnectionRecord::new(ConnectionSchedule::every(1, TimeUnit::Hours))
            .with_last_terminal_job_start(Utc::now()),
    );
    h.start();

    assert_ok!(h.service.reset_connection_and_skip_next_scheduling(h.connection_id));
    h.wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    // lookups fail right after the skipped run comes due at one hour
    tokio::time::sleep(Duration::from_secs(59 * 60)).await;
    h.config.fail_next("get_time_to_wait", 6);

    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    assert_eq!(h.jobs().len(), 1);
    assert!(!h.snapshot().state.skip_next_scheduling);

    tokio::time::sleep(Duration::from_secs(35 * 60)).await;
    let jobs = h.wait_for_jobs(|jobs| jobs.len() == 2).await;
    assert_eq!(jobs[1].kind, RunKind::Sync);
}

// ============================================
// Attempts
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failed_attempt_is_retried() {
    let h = Harness::started();
    h.runner.push([Step::Fail(Duration::from_secs(1))]);

    assert_ok!(h.service.submit_manual_sync(h.connection_id));
    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts.len(), 2);
    assert_eq!(job.attempts[0].status, AttemptStatus::Failed);
    assert_eq!(job.attempts[0].failure.as_deref(), Some("scripted failure"));
    assert_eq!(job.attempts[1].status, AttemptStatus::Succeeded);

    let started = h.runner.started();
    assert_eq!(
        started.iter().map(|input| input.attempt_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert!(started.iter().all(|input| input.job_id == job.job_id));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_job_fails_after_max_attempts() {
    let h = Harness::started();
    h.runner.push([Step::Fail(Duration::from_secs(1)); 5]);

    assert_ok!(h.service.submit_manual_sync(h.connection_id));
    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts.len(), 3);
    assert!(job
        .reason
        .as_deref()
        .is_some_and(|reason| reason.starts_with("failed after 3 attempts")));
    assert_eq!(h.runner.started().len(), 3);

    // no further attempts once the job failed
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(h.runner.started().len(), 3);
    assert_eq!(h.snapshot().phase, ManagerPhase::Waiting);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_max_attempt_lookup_failure_uses_fallback() {
    let h = Harness::started();
    h.config.fail_next("get_max_attempt", 100);
    h.runner.push([Step::Fail(Duration::from_secs(1)); 5]);

    assert_ok!(h.service.submit_manual_sync(h.connection_id));
    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempts.len(), 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_source_config_reaches_attempt() {
    let h = Harness::new(
        idle_record().with_source_config(serde_json::json!({"host": "db.internal", "port": 5432})),
    );
    h.start();

    assert_ok!(h.service.submit_manual_sync(h.connection_id));
    h.wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    let started = h.runner.started();
    assert_eq!(started[0].source_config["host"], "db.internal");
    assert_eq!(started[0].connection_id, h.connection_id);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_connection_without_source_fails_job() {
    let mut record = idle_record();
    record.source_id = None;
    let h = Harness::new(record);
    h.start();

    assert_ok!(h.service.submit_manual_sync(h.connection_id));
    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;

    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].reason.as_deref(), Some("connection has no source"));
    assert!(h.runner.started().is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_job_creation_failure_backs_off() {
    let h = Harness::started();
    // one full round of the three-attempt activity retry
    h.jobs.fail_next("create_job", 3);

    let started = Instant::now();
    assert_ok!(h.service.submit_manual_sync(h.connection_id));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.jobs().is_empty());
    assert_eq!(h.snapshot().phase, ManagerPhase::Waiting);

    let jobs = h.wait_for_jobs(|jobs| !jobs.is_empty()).await;
    assert_eq!(jobs[0].kind, RunKind::Sync);
    assert!(started.elapsed() >= Duration::from_secs(60));
}

// ============================================
// Hand-off and recovery
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_handoff_preserves_pending_state() {
    let h = Harness::with_config(idle_record(), test_config().with_cycles_before_handoff(3));
    h.start();

    assert_ok!(h.service.submit_manual_sync(h.connection_id));
    h.wait_for_jobs(|jobs| jobs.len() == 1 && jobs[0].status.is_terminal())
        .await;
    h.wait_for_idle().await;

    assert_ok!(h.service.reset_connection_and_skip_next_scheduling(h.connection_id));
    h.wait_for_jobs(|jobs| jobs.len() == 2 && jobs[1].status.is_terminal())
        .await;

    let status = h.wait_for_incarnation(2).await;
    assert!(matches!(status, InstanceStatus::Running { incarnation: 2 }));

    let query = h.snapshot();
    assert_eq!(query.phase, ManagerPhase::Waiting);
    assert!(query.state.skip_next_scheduling);
    assert!(query.job.is_idle());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failing_schedule_lookup_still_hands_off() {
    let h = Harness::with_config(idle_record(), test_config().with_cycles_before_handoff(3));
    h.config.fail_next("get_time_to_wait", u32::MAX);
    h.start();

    let status = h.wait_for_incarnation(2).await;
    assert!(matches!(status, InstanceStatus::Running { incarnation: 2 }));
    assert!(h.jobs().is_empty());
    assert_eq!(h.snapshot().phase, ManagerPhase::Waiting);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_resume_abandons_interrupted_run() {
    let h = Harness::new(idle_record());
    let job_id = assert_ok!(
        h.jobs
            .create_job(h.connection_id, RunKind::Sync)
            .await
    );
    let attempt_id = assert_ok!(h.jobs.create_attempt(job_id).await);

    let state = ControllerState {
        phase: Phase::Running {
            job: JobInformation::new(job_id, attempt_id),
            kind: RunKind::Sync,
        },
        ..ControllerState::default()
    };
    assert_ok!(h.service.resume_connection(
        ConnectionManagerInput::new(h.connection_id).with_carried(CarriedState {
            state,
            ..CarriedState::default()
        })
    ));

    let jobs = h
        .wait_for_jobs(|jobs| jobs.first().is_some_and(|j| j.status.is_terminal()))
        .await;
    assert_eq!(jobs[0].status, JobStatus::Cancelled);
    assert_eq!(
        jobs[0].reason.as_deref(),
        Some("abandoned by previous incarnation")
    );
    assert!(h.wait_for_idle().await.job.is_idle());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_resume_of_deleted_connection_terminates() {
    let h = Harness::new(idle_record());
    let state = ControllerState {
        phase: Phase::Terminated,
        ..ControllerState::default()
    };

    assert_ok!(h.service.resume_connection(
        ConnectionManagerInput::new(h.connection_id).with_carried(CarriedState {
            state,
            ..CarriedState::default()
        })
    ));

    let status = assert_ok!(h.service.wait_until_terminated(h.connection_id).await);
    assert!(matches!(
        status,
        InstanceStatus::Completed {
            output: ManagerExit::Deleted,
            incarnations: 1,
        }
    ));
    assert!(h.snapshot().state.deleted);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_duplicate_start_is_rejected() {
    let h = Harness::started();

    let error = h.service.start_connection(h.connection_id).unwrap_err();
    assert!(matches!(
        error,
        syncwarden_durable::RuntimeError::AlreadyExists(_)
    ));
}
