use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use mailforge_core::{
    Campaign, CampaignEmailPayload, CampaignId, CampaignStatus, CompanyId, EmailUsageRecord,
    TaskKind, TaskStatus,
};
use mailforge_engine::{Engine, EngineError};
use mailforge_infra::config::EngineConfig;
use mailforge_infra::mail::InMemoryMailTransport;
use mailforge_infra::scheduler::{ScheduledCampaignJob, TaskCleanupJob};
use mailforge_infra::store::{InMemoryStore, TaskStore};

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.workers = 2;
    config.queue.poll_interval_ms = 10;
    config.queue.shutdown_grace_secs = 5;
    config.dispatch.batch_launch_delay_ms = 0;
    config
}

fn seed_campaign(store: &InMemoryStore, recipients: usize) -> Campaign {
    let now = Utc::now();
    let company_id = CompanyId::new();
    let campaign = Campaign {
        id: CampaignId::new(),
        company_id,
        name: "Launch".into(),
        template_id: None,
        subject: "We are live".into(),
        html_body: "<html><body><p>Hello from Acme.</p></body></html>".into(),
        from_email: "hello@acme.example".into(),
        from_name: Some("Acme".into()),
        status: CampaignStatus::Draft,
        scheduled_at: None,
        sent_at: None,
        is_archived: false,
        created_at: now,
        updated_at: now,
    };
    store.insert_campaign(campaign.clone());
    store.set_contacts(
        campaign.id,
        (0..recipients).map(|i| format!("user{i}@example.org")).collect(),
    );
    store.set_usage(EmailUsageRecord {
        id: Uuid::now_v7(),
        company_id,
        remaining_emails: 500,
        emails_sent: 0,
        period_start: now - chrono::Duration::days(1),
        period_end: now + chrono::Duration::days(30),
    });
    campaign
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn campaign_task_runs_on_the_worker_pool() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(InMemoryMailTransport::new());
    let engine = Engine::build(config(), store.clone(), transport.clone()).unwrap();
    engine.start().await.unwrap();
    assert!(engine.queue().is_running());

    let campaign = seed_campaign(&store, 12);
    let task_id = engine
        .queue()
        .enqueue(TaskKind::SendCampaignEmail(CampaignEmailPayload {
            company_id: campaign.company_id,
            user_id: None,
            campaign_id: campaign.id,
        }))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = store.get_task(task_id).await.unwrap().unwrap();
        if task.status == TaskStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task stuck in {:?}", task.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    engine.shutdown().await.unwrap();
    assert!(!engine.queue().is_running());

    assert_eq!(transport.sent().len(), 12);
    assert_eq!(store.campaign(campaign.id).unwrap().status, CampaignStatus::Sent);
    assert_eq!(store.usage(campaign.company_id).unwrap().emails_sent, 12);
}

#[tokio::test]
async fn built_in_jobs_follow_the_scheduler_switch() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(InMemoryMailTransport::new());

    let engine = Engine::build(config(), store.clone(), transport.clone()).unwrap();
    let mut names = engine.scheduler().job_names();
    names.sort();
    assert_eq!(
        names,
        vec![
            ScheduledCampaignJob::<InMemoryStore>::NAME.to_string(),
            TaskCleanupJob::<InMemoryStore>::NAME.to_string(),
        ]
    );

    let mut disabled = config();
    disabled.scheduler.enabled = false;
    let engine = Engine::build(disabled, store, transport).unwrap();
    assert!(engine.scheduler().job_names().is_empty());
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let mut config = config();
    config.dispatch.batch_size = 0;

    let result = Engine::build(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryMailTransport::new()),
    );
    assert!(matches!(result, Err(EngineError::Config(_))));
}
