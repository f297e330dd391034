//! Retry policy and batch aggregation.

mod test_harness;

use std::time::Duration;

use imgfleet::config::BatchMode;
use imgfleet::error::ErrorKind;
use imgfleet::scheduler::{BatchStatus, JobSpec, JobStatus, TransformKind};
use test_harness::{
    assert_eventually, no_probe_config, register, start, Behaviour, ScriptedTransport, WAIT,
};

fn blur(input: &str) -> JobSpec {
    JobSpec::new(TransformKind::Blur, input).with_param("radius", "3")
}

#[tokio::test]
async fn test_retry_limit_keeps_transformation_message() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    transport.set_behaviour("w1", Behaviour::FailTransform);
    let coordinator = start(no_probe_config().with_retry_limit(2), transport.clone());
    register(&coordinator, &[("w1", 1)]).await;

    let id = coordinator.submit(blur("broken.png")).await.unwrap();
    let view = coordinator.wait_for_job(id, WAIT).await.unwrap();

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.attempts, 2);
    assert!(view.output_ref.is_none());
    assert_eq!(view.error_kind, Some(ErrorKind::RetryLimitExceeded));
    let error = view.error.unwrap();
    assert_eq!(error.root_cause().kind(), ErrorKind::TransformationError);
    assert_eq!(
        error.transformation_message(),
        Some("cannot process broken.png")
    );
    assert_eq!(transport.dispatched("w1"), 2);
}

#[tokio::test]
async fn test_failed_attempt_retries_and_succeeds_elsewhere() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    transport.set_behaviour("flaky", Behaviour::FailTransform);
    let coordinator = start(no_probe_config(), transport.clone());
    register(&coordinator, &[("flaky", 1), ("good", 1)]).await;

    let id = coordinator.submit(blur("a.png")).await.unwrap();
    let view = coordinator.wait_for_job(id, WAIT).await.unwrap();

    assert_eq!(view.status, JobStatus::Succeeded);
    assert_eq!(view.attempts, 1);
    assert_eq!(view.assigned_worker.as_deref(), Some("good"));
    // A successful retry clears the earlier error.
    assert!(view.error.is_none());
}

#[tokio::test]
async fn test_worker_suspected_after_repeated_errors() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    transport.set_behaviour("w1", Behaviour::Unreachable);
    let config = no_probe_config()
        .with_retry_limit(10)
        .with_error_threshold(3, 10_000);
    let coordinator = start(config, transport.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    register(&coordinator, &[("w1", 1)]).await;

    coordinator.submit(blur("a.png")).await.unwrap();
    assert_eventually(
        || async {
            coordinator
                .workers()
                .await
                .iter()
                .any(|w| w.id == "w1" && w.health != imgfleet::worker::HealthState::Healthy)
        },
        WAIT,
        "w1 should leave the healthy state after repeated dispatch errors",
    )
    .await;
}

#[tokio::test]
async fn test_best_effort_batch_reports_partial_success() {
    let transport = ScriptedTransport::new(Duration::from_millis(5));
    transport.fail_input("corrupt.png");
    let coordinator = start(no_probe_config().with_retry_limit(2), transport);
    register(&coordinator, &[("w1", 2), ("w2", 2)]).await;

    let specs = vec![
        blur("a.png"),
        blur("b.png"),
        blur("corrupt.png"),
        blur("c.png"),
        blur("d.png"),
    ];
    let batch_id = coordinator
        .submit_batch(specs, Some(BatchMode::BestEffort))
        .await
        .unwrap();
    let view = coordinator.wait_for_batch(batch_id, WAIT).await.unwrap();

    let failed_job = view
        .jobs
        .iter()
        .find(|j| j.input_ref == "corrupt.png")
        .unwrap();
    assert_eq!(
        view.status,
        BatchStatus::PartialSuccess {
            failed: vec![failed_job.id]
        }
    );
    assert_eq!(view.mode, BatchMode::BestEffort);
    assert_eq!(view.count(JobStatus::Succeeded), 4);
    assert_eq!(failed_job.status, JobStatus::Failed);
    assert_eq!(
        failed_job.error.as_ref().unwrap().transformation_message(),
        Some("corrupt image data")
    );

    // Batch view lists jobs in submission order.
    let inputs: Vec<&str> = view.jobs.iter().map(|j| j.input_ref.as_str()).collect();
    assert_eq!(inputs, vec!["a.png", "b.png", "corrupt.png", "c.png", "d.png"]);
}

#[tokio::test]
async fn test_all_or_nothing_batch_fails_on_one_failure() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    transport.fail_input("corrupt.png");
    let coordinator = start(no_probe_config().with_retry_limit(1), transport);
    register(&coordinator, &[("w1", 2)]).await;

    let specs = vec![blur("a.png"), blur("corrupt.png"), blur("b.png")];
    let batch_id = coordinator.submit_batch(specs, None).await.unwrap();
    let view = coordinator.wait_for_batch(batch_id, WAIT).await.unwrap();
    assert_eq!(view.mode, BatchMode::AllOrNothing);
    assert!(matches!(&view.status, BatchStatus::Failed { .. }));

    // The remaining members still run to completion.
    assert_eventually(
        || async {
            let view = coordinator.batch_status(batch_id).await.unwrap();
            view.jobs.iter().all(|j| j.status.is_terminal())
        },
        WAIT,
        "every member should finish",
    )
    .await;
    let view = coordinator.batch_status(batch_id).await.unwrap();
    assert!(matches!(&view.status, BatchStatus::Failed { failed } if failed.len() == 1));
    assert_eq!(view.count(JobStatus::Succeeded), 2);
}

#[tokio::test]
async fn test_all_or_nothing_batch_fails_before_other_jobs_finish() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    transport.set_behaviour("stuck", Behaviour::Hang);
    transport.set_behaviour("bad", Behaviour::FailTransform);
    let coordinator = start(no_probe_config().with_retry_limit(1), transport);
    // Equal load: the older "stuck" gets the first job, "bad" the second.
    register(&coordinator, &[("stuck", 2), ("bad", 1)]).await;

    let specs = vec![blur("a.png"), blur("b.png"), blur("c.png")];
    let batch_id = coordinator.submit_batch(specs, None).await.unwrap();
    let view = coordinator.wait_for_batch(batch_id, WAIT).await.unwrap();

    let (first, second) = (&view.jobs[0], &view.jobs[1]);
    assert_eq!(first.status, JobStatus::Dispatched);
    assert_eq!(second.status, JobStatus::Failed);
    assert!(matches!(&view.status, BatchStatus::Failed { failed } if failed.contains(&second.id)));

    // Reading the status again while "a.png" still hangs gives the same answer.
    let again = coordinator.batch_status(batch_id).await.unwrap();
    assert!(again.status.is_terminal());
    assert_eq!(again.jobs[0].status, JobStatus::Dispatched);
}

#[tokio::test]
async fn test_best_effort_batch_waits_for_every_job() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    transport.set_behaviour("stuck", Behaviour::Hang);
    transport.set_behaviour("bad", Behaviour::FailTransform);
    let coordinator = start(no_probe_config().with_retry_limit(1), transport.clone());
    register(&coordinator, &[("stuck", 2), ("bad", 1)]).await;

    let specs = vec![blur("a.png"), blur("b.png")];
    let batch_id = coordinator
        .submit_batch(specs, Some(BatchMode::BestEffort))
        .await
        .unwrap();
    assert_eventually(
        || async {
            let view = coordinator.batch_status(batch_id).await.unwrap();
            view.count(JobStatus::Failed) == 1
        },
        WAIT,
        "the job on the failing worker should fail",
    )
    .await;

    let view = coordinator.batch_status(batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::InProgress);
    assert_eq!(transport.active("stuck"), 1);
}

#[tokio::test]
async fn test_batch_in_progress_until_last_job_finishes() {
    let transport = ScriptedTransport::new(Duration::from_millis(200));
    let coordinator = start(no_probe_config(), transport);
    register(&coordinator, &[("w1", 1)]).await;

    let specs = vec![blur("a.png"), blur("b.png")];
    let batch_id = coordinator.submit_batch(specs, None).await.unwrap();

    let view = coordinator.batch_status(batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::InProgress);
    assert_eq!(view.jobs.len(), 2);

    let view = coordinator.wait_for_batch(batch_id, WAIT).await.unwrap();
    assert_eq!(view.status, BatchStatus::Succeeded);
}

#[tokio::test]
async fn test_wait_times_out() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    let coordinator = start(no_probe_config(), transport);

    // No workers, so the job never runs.
    let id = coordinator.submit(blur("a.png")).await.unwrap();
    let result = coordinator
        .wait_for_job(id, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(imgfleet::FleetError::WaitTimeout(waited)) if waited == id));
}
