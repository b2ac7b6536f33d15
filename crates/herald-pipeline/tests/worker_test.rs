//! Queue worker dispatch: missing handlers, bad payloads, handler errors.

#![allow(clippy::unwrap_used)]

use herald_core::JobStatus;
use herald_pipeline::{queue::AutomationTriggerJob, Job, JobQueue, QueueName};
use herald_testing::{FailPoint, TestHarness};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn queue_without_handler_fails_jobs_visibly() {
    let harness = TestHarness::new();
    let job = Job::AutomationTrigger(AutomationTriggerJob {
        automation_id: Uuid::new_v4(),
        contact_id: herald_core::ContactId::new(),
        event: "signed_up".to_string(),
    });
    harness.backend.publish(job, harness.now()).await.unwrap();

    assert_eq!(harness.run_queue(QueueName::AutomationTrigger).await.unwrap(), 1);

    let jobs = harness.backend.jobs(QueueName::AutomationTrigger).await;
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].last_error.as_deref(), Some("NO_HANDLER"));
}

#[tokio::test]
async fn undecodable_payload_is_failed_not_retried() {
    let harness = TestHarness::new();
    harness.backend.insert_raw_job(QueueName::SmsSend, json!({ "kind": "sms-send", "phone": 7 })).await;

    harness.run_queue(QueueName::SmsSend).await.unwrap();

    let jobs = harness.backend.jobs(QueueName::SmsSend).await;
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].last_error.as_deref().unwrap().starts_with("INVALID_PAYLOAD"));
    assert_eq!(harness.run_queue(QueueName::SmsSend).await.unwrap(), 0);
}

#[tokio::test]
async fn payload_on_the_wrong_queue_is_failed() {
    let harness = TestHarness::new();
    harness.backend.insert_raw_job(QueueName::SmsSend, json!({ "kind": "reconciliation" })).await;

    harness.run_queue(QueueName::SmsSend).await.unwrap();

    let jobs = harness.backend.jobs(QueueName::SmsSend).await;
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].last_error.as_deref().unwrap().contains("unexpected reconciliation payload"));
}

#[tokio::test]
async fn handler_error_reschedules_the_job() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.enqueue(campaign.id, "req-1").await.unwrap();

    harness.backend.fail_next(FailPoint::FanOutChunk, "deadlock detected").await;
    harness.run_queue(QueueName::CampaignSend).await.unwrap();

    let jobs = harness.backend.jobs(QueueName::CampaignSend).await;
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(jobs[0].attempts, 1);
    assert!(jobs[0].run_at > harness.now());
    assert!(jobs[0].last_error.as_deref().unwrap().contains("deadlock detected"));

    let stats = harness.engine().stats().await;
    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(stats.jobs_retried, 1);
    assert_eq!(stats.in_flight_jobs, 0);
}

#[tokio::test]
async fn claim_failure_surfaces_to_the_caller() {
    let harness = TestHarness::new();
    harness.backend.fail_next(FailPoint::Claim, "pool exhausted").await;

    assert!(harness.run_queue(QueueName::SmsSend).await.is_err());
    assert_eq!(harness.run_queue(QueueName::SmsSend).await.unwrap(), 0);
}
