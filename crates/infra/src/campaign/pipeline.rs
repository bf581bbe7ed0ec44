use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tracing::{Instrument, error, info, info_span, instrument, warn};

use mailforge_core::{
    Campaign, CampaignError, CampaignId, CampaignStatus, CompanyId, DomainError, UserId,
};

use super::batch::{self, BatchContext, UsageGate};
use super::report::DispatchReport;
use super::sender::resolve_sender;
use super::tracking::{TrackingError, TrackingInjector};
use crate::config::DispatchConfig;
use crate::jobs::TaskError;
use crate::mail::{ContentAnalyzer, HeuristicContentAnalyzer, MailTransport};
use crate::store::{Store, StoreError};
use crate::util::panic_message;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Nothing was sent; the campaign was marked failed where allowed.
    #[error("campaign cannot be sent: {0}")]
    Precondition(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DispatchError> for TaskError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Precondition(e) => TaskError::permanent(e.to_string()),
            DispatchError::Store(e) => TaskError::from(e),
        }
    }
}

/// Sends a campaign to all of its recipients in concurrent batches.
pub struct CampaignDispatcher<S> {
    store: Arc<S>,
    transport: Arc<dyn MailTransport>,
    analyzer: Arc<dyn ContentAnalyzer>,
    tracking: TrackingInjector,
    config: DispatchConfig,
}

impl<S: Store + 'static> CampaignDispatcher<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn MailTransport>,
        config: DispatchConfig,
    ) -> Result<Self, TrackingError> {
        Ok(Self {
            store,
            transport,
            analyzer: Arc::new(HeuristicContentAnalyzer::default()),
            tracking: TrackingInjector::new(&config.tracking_base_url)?,
            config,
        })
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ContentAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Run the full dispatch of `campaign_id` on behalf of `company_id`.
    ///
    /// Per-recipient failures do not fail the dispatch; they are reported and
    /// persisted as campaign errors. The campaign ends up `sent` even when no
    /// recipient could be reached.
    #[instrument(
        skip_all,
        fields(company_id = %company_id, campaign_id = %campaign_id, user_id = ?user_id),
        err
    )]
    pub async fn dispatch(
        &self,
        company_id: CompanyId,
        user_id: Option<UserId>,
        campaign_id: CampaignId,
    ) -> Result<DispatchReport, DispatchError> {
        let Some(campaign) = self.store.get_campaign(company_id, campaign_id).await? else {
            warn!("campaign not found for company");
            return Err(DomainError::not_found(format!("campaign {campaign_id}")).into());
        };

        if let Err(reason) = self.check_preconditions(&campaign).await? {
            self.reject(&campaign, &reason).await?;
            return Err(reason.into());
        }

        self.store
            .update_campaign_status(campaign_id, CampaignStatus::Queued)
            .await?;
        let recipients = self.store.get_contact_emails_for_campaign(campaign_id).await?;

        let safety = self.analyzer.analyze(&campaign.html_body);
        if !safety.is_safe {
            warn!(
                spam_score = safety.spam_score,
                patterns = ?safety.suspicious_patterns,
                "campaign content refused by safety analysis"
            );
        }

        let sender = resolve_sender(
            self.store.as_ref(),
            &campaign,
            &self.config.default_from_domain,
        )
        .await?;

        let batches = batch::partition(&recipients, self.config.batch_size);
        let mut report =
            DispatchReport::new(campaign_id, company_id, recipients.len(), batches.len());
        info!(
            recipients = recipients.len(),
            batches = batches.len(),
            from = %sender.from_email,
            "dispatching campaign"
        );

        let ctx = Arc::new(BatchContext {
            store: self.store.clone(),
            transport: self.transport.clone(),
            tracking: self.tracking.clone(),
            campaign,
            sender,
            safety,
            usage: UsageGate::default(),
        });

        let delay = self.config.batch_launch_delay();
        let mut handles = Vec::with_capacity(batches.len());
        for (index, recipients) in batches.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let span = info_span!("campaign_batch", batch = index, size = recipients.len());
            handles.push(tokio::spawn(
                batch::process_batch(ctx.clone(), index, recipients).instrument(span),
            ));
        }

        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(batch) => report.absorb(batch),
                Err(e) if e.is_panic() => {
                    let message = panic_message(&*e.into_panic());
                    error!(batch = index, panic = %message, "campaign batch panicked");
                    report.batch_panicked(index, message);
                }
                Err(e) => {
                    error!(batch = index, error = %e, "campaign batch was cancelled");
                    report.batch_panicked(index, e.to_string());
                }
            }
        }

        self.store.mark_campaign_sent(campaign_id, Utc::now()).await?;

        for row in report.campaign_errors() {
            if let Err(e) = self.store.create_campaign_error(&row).await {
                error!(error_type = %row.error_type, error = %e, "failed to record campaign error");
            }
        }

        if report.nothing_delivered() {
            warn!(
                recipients = report.recipients,
                failed = report.failed(),
                "campaign marked sent but no recipient received it"
            );
        }
        info!(
            attempted = report.attempted,
            sent = report.sent,
            failed = report.failed(),
            "campaign dispatched"
        );

        Ok(report)
    }

    /// `Ok(Err(_))` is a failed precondition; `Err(_)` a storage failure.
    async fn check_preconditions(
        &self,
        campaign: &Campaign,
    ) -> Result<Result<(), DomainError>, StoreError> {
        if let Err(e) = campaign.ensure_sendable().and_then(|()| campaign.ensure_template()) {
            return Ok(Err(e));
        }

        let usage = self
            .store
            .get_current_usage(campaign.company_id, Utc::now())
            .await?;
        Ok(match usage {
            None => Err(DomainError::not_found(format!(
                "email usage record for company {}",
                campaign.company_id
            ))),
            Some(usage) if !usage.has_capacity() => Err(DomainError::QuotaExceeded {
                company_id: campaign.company_id,
                remaining: usage.remaining_emails,
            }),
            Some(_) => Ok(()),
        })
    }

    async fn reject(&self, campaign: &Campaign, reason: &DomainError) -> Result<(), StoreError> {
        warn!(status = %campaign.status, reason = %reason, "campaign precondition failed");

        if campaign.status.can_transition_to(CampaignStatus::Failed) {
            self.store
                .update_campaign_status(campaign.id, CampaignStatus::Failed)
                .await?;
        }
        self.store
            .create_campaign_error(&CampaignError::precondition(
                campaign.id,
                campaign.company_id,
                reason,
            ))
            .await
    }
}
