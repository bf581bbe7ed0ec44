//! Per-batch sending and quota accounting.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use mailforge_core::{Campaign, CompanyId, NewEmailCampaignResult};

use super::sender::{ResolvedSender, SigningMode};
use super::tracking::TrackingInjector;
use crate::mail::{self, MailError, MailRequest, MailTransport, SafetyReport};
use crate::store::{Store, StoreResult, UsageStore};

/// Split `items` into consecutive chunks of at most `size` (a size of zero is treated as one).
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientErrorKind {
    InvalidAddress,
    UnsafeContent,
    Tracking,
    Signing,
    Transport,
    QuotaExhausted,
}

impl RecipientErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientErrorKind::InvalidAddress => "invalid_address",
            RecipientErrorKind::UnsafeContent => "unsafe_content",
            RecipientErrorKind::Tracking => "tracking",
            RecipientErrorKind::Signing => "signing",
            RecipientErrorKind::Transport => "transport",
            RecipientErrorKind::QuotaExhausted => "quota_exhausted",
        }
    }
}

/// A single recipient that was not sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientError {
    pub recipient: String,
    pub kind: RecipientErrorKind,
    pub message: String,
}

impl RecipientError {
    fn new(recipient: &str, kind: RecipientErrorKind, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.to_string(),
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub attempted: usize,
    pub sent: usize,
    pub recipient_errors: Vec<RecipientError>,
    /// Usage bookkeeping failures; these never fail a send.
    pub usage_warnings: Vec<String>,
}

/// Serializes usage reads and writes of one campaign and tracks the
/// allowance already handed to in-flight batches.
#[derive(Debug, Default)]
pub(crate) struct UsageGate {
    reserved: Mutex<i64>,
}

impl UsageGate {
    /// Reserve up to `wanted` sends against the company's remaining allowance.
    async fn reserve<S: UsageStore + ?Sized>(
        &self,
        store: &S,
        company_id: CompanyId,
        wanted: usize,
    ) -> StoreResult<usize> {
        let mut reserved = self.reserved.lock().await;
        let remaining = store
            .get_current_usage(company_id, Utc::now())
            .await?
            .map_or(0, |usage| usage.remaining_emails);
        let available = usize::try_from((remaining - *reserved).max(0)).unwrap_or(usize::MAX);
        let allowed = available.min(wanted);
        *reserved += allowed as i64;
        Ok(allowed)
    }

    /// Record `sent` deliveries and release a reservation of `reserved`.
    async fn settle<S: UsageStore + ?Sized>(
        &self,
        store: &S,
        company_id: CompanyId,
        reserved: usize,
        sent: usize,
    ) -> StoreResult<()> {
        let mut guard = self.reserved.lock().await;
        let result = if sent > 0 {
            store
                .increment_usage(company_id, Utc::now(), sent as i64)
                .await
                .map(|_| ())
        } else {
            Ok(())
        };
        *guard -= reserved as i64;
        result
    }
}

/// Everything a batch needs, shared by all batches of one dispatch.
pub(crate) struct BatchContext<S> {
    pub store: Arc<S>,
    pub transport: Arc<dyn MailTransport>,
    pub tracking: TrackingInjector,
    pub campaign: Campaign,
    pub sender: ResolvedSender,
    pub safety: SafetyReport,
    pub usage: UsageGate,
}

pub(crate) async fn process_batch<S: Store + 'static>(
    ctx: Arc<BatchContext<S>>,
    index: usize,
    recipients: Vec<String>,
) -> BatchReport {
    let company_id = ctx.campaign.company_id;
    let mut report = BatchReport {
        index,
        ..BatchReport::default()
    };

    // Malformed addresses never consume allowance.
    let (recipients, malformed): (Vec<String>, Vec<String>) = recipients
        .into_iter()
        .partition(|recipient| mail::is_valid_email(recipient));
    for recipient in &malformed {
        report.attempted += 1;
        report.recipient_errors.push(RecipientError::new(
            recipient,
            RecipientErrorKind::InvalidAddress,
            "malformed address",
        ));
    }

    let allowed = match ctx
        .usage
        .reserve(ctx.store.as_ref(), company_id, recipients.len())
        .await
    {
        Ok(allowed) => allowed,
        Err(e) => {
            // The allowance was checked before dispatch; keep sending.
            warn!(batch = index, error = %e, "failed to read usage before batch");
            report
                .usage_warnings
                .push(format!("batch {index}: usage read failed: {e}"));
            recipients.len()
        }
    };

    let (to_send, over_quota) = recipients.split_at(allowed.min(recipients.len()));
    for recipient in over_quota {
        report.recipient_errors.push(RecipientError::new(
            recipient,
            RecipientErrorKind::QuotaExhausted,
            "email allowance exhausted",
        ));
    }
    if !over_quota.is_empty() {
        warn!(batch = index, skipped = over_quota.len(), "email allowance exhausted mid-campaign");
    }

    for recipient in to_send {
        report.attempted += 1;
        match send_one(&ctx, recipient).await {
            Ok(()) => {
                report.sent += 1;
                let result = NewEmailCampaignResult {
                    campaign_id: ctx.campaign.id,
                    company_id,
                    recipient_email: recipient.clone(),
                    sent_at: Utc::now(),
                };
                if let Err(e) = ctx.store.create_email_campaign_result(result).await {
                    warn!(batch = index, recipient = %recipient, error = %e, "failed to record send result");
                }
            }
            Err(err) => {
                debug!(batch = index, recipient = %recipient, kind = err.kind.as_str(), error = %err.message, "recipient skipped");
                report.recipient_errors.push(err);
            }
        }
    }

    if let Err(e) = ctx
        .usage
        .settle(ctx.store.as_ref(), company_id, allowed, report.sent)
        .await
    {
        warn!(batch = index, sent = report.sent, error = %e, "failed to update email usage");
        report
            .usage_warnings
            .push(format!("batch {index}: usage update for {} sends failed: {e}", report.sent));
    }

    report
}

async fn send_one<S: Store>(ctx: &BatchContext<S>, recipient: &str) -> Result<(), RecipientError> {
    use RecipientErrorKind as Kind;

    if !ctx.safety.is_safe {
        return Err(RecipientError::new(
            recipient,
            Kind::UnsafeContent,
            ctx.safety.message.clone(),
        ));
    }

    let html = ctx
        .tracking
        .inject(&ctx.campaign.html_body, ctx.campaign.id, recipient)
        .map_err(|e| RecipientError::new(recipient, Kind::Tracking, e.to_string()))?;

    let mut request = MailRequest::html(
        ctx.sender.from_email.clone(),
        recipient,
        ctx.campaign.subject.clone(),
        html,
    );
    request.from_name = ctx.sender.from_name.clone();

    match &ctx.sender.signing {
        SigningMode::Unsigned => {}
        SigningMode::Misconfigured(reason) => {
            return Err(RecipientError::new(recipient, Kind::Signing, reason.clone()));
        }
        SigningMode::Dkim(key) => {
            let mut message = mail::build_message(&request).map_err(|e| mail_error(recipient, e))?;
            message.sign(key.config());
            request.signed_message = Some(message.formatted());
        }
    }

    ctx.transport
        .send(&request)
        .await
        .map_err(|e| mail_error(recipient, e))
}

fn mail_error(recipient: &str, err: MailError) -> RecipientError {
    let kind = match err {
        MailError::InvalidAddress { .. } => RecipientErrorKind::InvalidAddress,
        MailError::Build(_) | MailError::Transport(_) => RecipientErrorKind::Transport,
    };
    RecipientError::new(recipient, kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::store::{FailPoint, InMemoryStore};
    use crate::test_support::usage;

    #[test]
    fn partitions_into_bounded_chunks() {
        let items: Vec<u32> = (0..25).collect();
        let batches = partition(&items, 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![20, 21, 22, 23, 24]);
        assert!(partition::<u32>(&[], 10).is_empty());
        assert_eq!(partition(&items, 0).len(), 25);
    }

    #[tokio::test]
    async fn gate_never_hands_out_more_than_remaining() {
        let store = InMemoryStore::new();
        let company = CompanyId::new();
        store.set_usage(usage(company, 15));
        let gate = UsageGate::default();

        assert_eq!(gate.reserve(&store, company, 10).await.unwrap(), 10);
        assert_eq!(gate.reserve(&store, company, 10).await.unwrap(), 5);
        assert_eq!(gate.reserve(&store, company, 10).await.unwrap(), 0);

        gate.settle(&store, company, 10, 8).await.unwrap();
        assert_eq!(store.usage(company).unwrap().remaining_emails, 7);
        // 7 remaining, 5 still reserved by the second batch.
        assert_eq!(gate.reserve(&store, company, 10).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_usage_write_still_releases_reservation() {
        let store = InMemoryStore::new();
        let company = CompanyId::new();
        store.set_usage(usage(company, 10));
        store.inject_failure(FailPoint::IncrementUsage, 1);
        let gate = UsageGate::default();

        assert_eq!(gate.reserve(&store, company, 10).await.unwrap(), 10);
        assert!(gate.settle(&store, company, 10, 10).await.is_err());
        assert_eq!(gate.reserve(&store, company, 10).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn missing_usage_record_allows_nothing() {
        let store = InMemoryStore::new();
        let gate = UsageGate::default();
        assert_eq!(gate.reserve(&store, CompanyId::new(), 3).await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn partition_preserves_order_and_bounds(len in 0usize..200, size in 1usize..40) {
            let items: Vec<usize> = (0..len).collect();
            let batches = partition(&items, size);

            prop_assert_eq!(batches.len(), len.div_ceil(size));
            prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
            let flat: Vec<usize> = batches.into_iter().flatten().collect();
            prop_assert_eq!(flat, items);
        }
    }
}
