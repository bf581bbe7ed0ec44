//! End-to-end tests across the queue, dispatch pipeline, scheduler and workers.
//!
//! Everything runs on the in-memory store and mail transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use mailforge_core::{
    AdminNotificationPayload, AuditAction, AuditLogPayload, CampaignEmailPayload, CampaignStatus,
    CompanyId, ExecutionStatus, TaskKind, TaskStatus, UserId, UserNotificationPayload,
    WelcomeEmailPayload,
};

use crate::campaign::{CampaignDispatcher, RecipientErrorKind};
use crate::config::{DispatchConfig, MailConfig, QueueConfig};
use crate::jobs::{EngineTaskHandler, TaskQueue};
use crate::mail::InMemoryMailTransport;
use crate::scheduler::{CronScheduler, RunOutcome, ScheduledCampaignJob};
use crate::store::{InMemoryStore, TaskStore};
use crate::test_support::{campaign, dkim_private_key, recipients, usage, verified_domain};
use crate::workers::{AuditWorker, NotificationWorker};

struct Harness {
    store: Arc<InMemoryStore>,
    transport: Arc<InMemoryMailTransport>,
    dispatcher: Arc<CampaignDispatcher<InMemoryStore>>,
    queue: TaskQueue<InMemoryStore>,
}

fn harness(batch_size: usize) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(InMemoryMailTransport::new());
    let dispatch = DispatchConfig {
        batch_size,
        batch_launch_delay_ms: 5,
        ..DispatchConfig::default()
    };
    let dispatcher =
        Arc::new(CampaignDispatcher::new(store.clone(), transport.clone(), dispatch).unwrap());
    let mail = MailConfig {
        admin_email: Some("ops@mailforge.example".into()),
        ..MailConfig::default()
    };
    let handler = EngineTaskHandler::new(
        dispatcher.clone(),
        AuditWorker::new(store.clone()),
        NotificationWorker::new(store.clone(), transport.clone(), mail),
    );
    let queue = TaskQueue::new(
        store.clone(),
        Arc::new(handler),
        QueueConfig {
            base_retry_delay_ms: 0,
            poll_interval_ms: 10,
            ..QueueConfig::default()
        },
    );
    Harness {
        store,
        transport,
        dispatcher,
        queue,
    }
}

async fn drain(queue: &TaskQueue<InMemoryStore>) {
    while queue.process_next().await.unwrap() {}
}

#[tokio::test]
async fn campaign_task_sends_every_batch() {
    let h = harness(10);
    let company_id = CompanyId::new();
    let campaign = campaign(company_id);
    h.store.insert_campaign(campaign.clone());
    h.store.set_contacts(campaign.id, recipients(25));
    h.store.set_usage(usage(company_id, 1_000));

    let task_id = h
        .queue
        .enqueue(TaskKind::SendCampaignEmail(CampaignEmailPayload {
            company_id,
            user_id: Some(UserId::new()),
            campaign_id: campaign.id,
        }))
        .await
        .unwrap();
    drain(&h.queue).await;

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let stored = h.store.campaign(campaign.id).unwrap();
    assert_eq!(stored.status, CampaignStatus::Sent);
    assert!(stored.sent_at.is_some());

    assert_eq!(h.transport.sent().len(), 25);
    assert_eq!(h.store.campaign_results(campaign.id).len(), 25);
    assert!(h.store.campaign_errors(campaign.id).is_empty());

    let usage = h.store.usage(company_id).unwrap();
    assert_eq!(usage.emails_sent, 25);
    assert_eq!(usage.remaining_emails, 975);
}

#[tokio::test]
async fn malformed_recipients_do_not_stop_the_rest() {
    let h = harness(4);
    let company_id = CompanyId::new();
    let campaign = campaign(company_id);
    let mut emails = recipients(7);
    emails.extend(["no-at-sign".to_string(), "two@@example.com".into(), "".into()]);
    h.store.insert_campaign(campaign.clone());
    h.store.set_contacts(campaign.id, emails);
    h.store.set_usage(usage(company_id, 100));

    let report = h.dispatcher.dispatch(company_id, None, campaign.id).await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.sent, 7);
    assert_eq!(report.failed(), 3);
    assert_eq!(h.store.campaign_results(campaign.id).len(), 7);
    assert_eq!(h.store.usage(company_id).unwrap().emails_sent, 7);

    let errors = h.store.campaign_errors(campaign.id);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type, "recipient_failure");
    assert!(errors[0].error_message.contains("3 of 10"));
    assert_eq!(h.store.campaign(campaign.id).unwrap().status, CampaignStatus::Sent);
}

#[tokio::test]
async fn quota_caps_concurrent_batches() {
    let h = harness(3);
    let company_id = CompanyId::new();
    let campaign = campaign(company_id);
    h.store.insert_campaign(campaign.clone());
    h.store.set_contacts(campaign.id, recipients(12));
    h.store.set_usage(usage(company_id, 5));

    let report = h.dispatcher.dispatch(company_id, None, campaign.id).await.unwrap();

    assert_eq!(report.sent, 5);
    assert_eq!(report.failed(), 7);
    assert_eq!(h.transport.sent().len(), 5);
    let usage = h.store.usage(company_id).unwrap();
    assert_eq!(usage.emails_sent, 5);
    assert_eq!(usage.remaining_emails, 0);
}

#[tokio::test]
async fn malformed_recipients_do_not_consume_allowance() {
    let h = harness(10);
    let company_id = CompanyId::new();
    let campaign = campaign(company_id);
    let mut emails = vec!["not-an-address".to_string(), "two@@example.com".into()];
    emails.extend(recipients(4));
    h.store.insert_campaign(campaign.clone());
    h.store.set_contacts(campaign.id, emails);
    h.store.set_usage(usage(company_id, 4));

    let report = h.dispatcher.dispatch(company_id, None, campaign.id).await.unwrap();

    assert_eq!(report.batches, 1);
    assert_eq!(report.sent, 4);
    assert_eq!(report.failed(), 2);
    assert!(
        report
            .recipient_errors
            .iter()
            .all(|e| e.kind == RecipientErrorKind::InvalidAddress)
    );
    assert_eq!(h.transport.sent().len(), 4);
    assert_eq!(h.store.usage(company_id).unwrap().remaining_emails, 0);
}

#[tokio::test]
async fn exhausted_quota_fails_the_campaign_task_permanently() {
    let h = harness(10);
    let company_id = CompanyId::new();
    let campaign = campaign(company_id);
    h.store.insert_campaign(campaign.clone());
    h.store.set_contacts(campaign.id, recipients(3));
    h.store.set_usage(usage(company_id, 0));

    let task_id = h
        .queue
        .enqueue(TaskKind::SendCampaignEmail(CampaignEmailPayload {
            company_id,
            user_id: None,
            campaign_id: campaign.id,
        }))
        .await
        .unwrap();
    drain(&h.queue).await;

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);

    assert_eq!(h.store.campaign(campaign.id).unwrap().status, CampaignStatus::Failed);
    assert!(h.transport.sent().is_empty());
    let errors = h.store.campaign_errors(campaign.id);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type, "quota_exceeded");
}

#[tokio::test]
async fn verified_domain_mail_is_dkim_signed() {
    let h = harness(10);
    let company_id = CompanyId::new();
    let campaign = campaign(company_id);
    h.store.insert_campaign(campaign.clone());
    h.store.set_contacts(campaign.id, recipients(2));
    h.store.set_usage(usage(company_id, 10));
    h.store
        .insert_domain(verified_domain(company_id, "acme.example", dkim_private_key()));

    let report = h.dispatcher.dispatch(company_id, None, campaign.id).await.unwrap();
    assert_eq!(report.sent, 2);

    for mail in h.transport.sent() {
        assert_eq!(mail.request.from_email, "news@acme.example");
        let raw = String::from_utf8(mail.raw).unwrap();
        let (head, _) = raw.split_once("\r\n\r\n").unwrap();
        assert!(head.to_ascii_lowercase().contains("dkim-signature:"));
        for tag in ["a=rsa-sha256", "c=relaxed/relaxed", "d=acme.example", "s=mf1"] {
            assert!(head.contains(tag), "{tag} missing from {head}");
        }
    }
}

#[tokio::test]
async fn scheduler_sends_due_campaigns() {
    let h = harness(10);
    let company_id = CompanyId::new();
    let mut due = campaign(company_id);
    due.status = CampaignStatus::Scheduled;
    due.scheduled_at = Some(Utc::now() - chrono::Duration::minutes(5));
    h.store.insert_campaign(due.clone());
    h.store.set_contacts(due.id, recipients(4));
    h.store.set_usage(usage(company_id, 10));

    let scheduler = CronScheduler::new(h.store.clone());
    scheduler
        .register(Arc::new(ScheduledCampaignJob::new(
            h.dispatcher.clone(),
            h.store.clone(),
            "* * * * *",
            50,
        )))
        .unwrap();

    let outcome = scheduler
        .trigger_now(ScheduledCampaignJob::<InMemoryStore>::NAME)
        .await
        .unwrap();
    let RunOutcome::Executed(log) = outcome else {
        panic!("scheduled campaign job did not run: {outcome:?}");
    };
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.output, Some(json!({
        "due": 1,
        "dispatched": 1,
        "rejected": 0,
        "errored": 0,
        "sent": 4
    })));
    assert_eq!(h.store.campaign(due.id).unwrap().status, CampaignStatus::Sent);

    // A second run finds nothing left to send.
    let RunOutcome::Executed(log) = scheduler
        .trigger_now(ScheduledCampaignJob::<InMemoryStore>::NAME)
        .await
        .unwrap()
    else {
        panic!("scheduled campaign job did not run");
    };
    assert_eq!(log.output, Some(json!({ "due": 0 })));
    assert_eq!(h.transport.sent().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pool_runs_audit_and_notification_tasks() {
    let h = harness(10);
    let company_id = CompanyId::new();
    let user_id = UserId::new();

    h.queue
        .enqueue(TaskKind::AuditLogCreate(AuditLogPayload {
            company_id,
            user_id: Some(user_id),
            action: AuditAction::Create,
            resource: "contact_list".into(),
            resource_id: Some("list-7".into()),
            details: json!({ "contacts": 120 }),
            ip_address: None,
        }))
        .await
        .unwrap();
    h.queue
        .enqueue(TaskKind::CreateUserNotification(UserNotificationPayload {
            user_id,
            title: "Import finished".into(),
            message: "120 contacts imported".into(),
            kind: "info".into(),
        }))
        .await
        .unwrap();
    h.queue
        .enqueue(TaskKind::SendAdminNotification(AdminNotificationPayload {
            company_id: Some(company_id),
            title: "New signup".into(),
            message: "A company joined".into(),
            kind: "info".into(),
        }))
        .await
        .unwrap();
    h.queue
        .enqueue(TaskKind::SendWelcomeEmail(WelcomeEmailPayload {
            user_id,
            email: "jane@example.com".into(),
            first_name: "Jane".into(),
        }))
        .await
        .unwrap();

    h.queue.start(2);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counts = h.store.task_counts_by_status().await.unwrap();
        if counts.completed == 4 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tasks did not finish: {counts:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.queue.shutdown(Duration::from_secs(2)).await.unwrap();

    assert_eq!(h.store.audit_logs().len(), 1);
    assert_eq!(h.store.user_notifications().len(), 1);
    assert_eq!(h.store.admin_notifications().len(), 1);
    assert_eq!(h.transport.sent_to("ops@mailforge.example").len(), 1);
    assert_eq!(h.transport.sent_to("jane@example.com").len(), 1);
}

#[tokio::test]
async fn rejected_admin_mail_is_retried_without_duplicates() {
    let h = harness(10);
    h.transport.reject("ops@mailforge.example");

    let task_id = h
        .queue
        .enqueue_with_retries(
            TaskKind::SendAdminNotification(AdminNotificationPayload {
                company_id: None,
                title: "Disk almost full".into(),
                message: "92% used".into(),
                kind: "warning".into(),
            }),
            3,
        )
        .await
        .unwrap();
    drain(&h.queue).await;

    let task = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.error_message.unwrap().contains("550"));
    assert_eq!(h.store.admin_notifications().len(), 1);
}
