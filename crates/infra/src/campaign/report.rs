use std::collections::BTreeMap;

use serde::Serialize;

use mailforge_core::{CampaignError, CampaignErrorType, CampaignId, CompanyId};

use super::batch::{BatchReport, RecipientError};

/// Failures listed per `CampaignError` row before the message is summarized.
const MAX_LISTED_FAILURES: usize = 20;

/// Outcome of one campaign dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub campaign_id: CampaignId,
    pub company_id: CompanyId,
    pub recipients: usize,
    pub batches: usize,
    pub attempted: usize,
    pub sent: usize,
    pub recipient_errors: Vec<RecipientError>,
    pub usage_warnings: Vec<String>,
    pub batch_panics: Vec<String>,
}

impl DispatchReport {
    pub(crate) fn new(
        campaign_id: CampaignId,
        company_id: CompanyId,
        recipients: usize,
        batches: usize,
    ) -> Self {
        Self {
            campaign_id,
            company_id,
            recipients,
            batches,
            attempted: 0,
            sent: 0,
            recipient_errors: Vec::new(),
            usage_warnings: Vec::new(),
            batch_panics: Vec::new(),
        }
    }

    pub(crate) fn absorb(&mut self, batch: BatchReport) {
        self.attempted += batch.attempted;
        self.sent += batch.sent;
        self.recipient_errors.extend(batch.recipient_errors);
        self.usage_warnings.extend(batch.usage_warnings);
    }

    pub(crate) fn batch_panicked(&mut self, index: usize, message: String) {
        self.batch_panics.push(format!("batch {index}: {message}"));
    }

    pub fn failed(&self) -> usize {
        self.recipient_errors.len()
    }

    /// No recipient received the campaign even though there were recipients.
    pub fn nothing_delivered(&self) -> bool {
        self.recipients > 0 && self.sent == 0
    }

    /// One `CampaignError` row per failure category that occurred.
    pub fn campaign_errors(&self) -> Vec<CampaignError> {
        let mut rows = Vec::new();

        if !self.recipient_errors.is_empty() {
            let mut by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
            for err in &self.recipient_errors {
                *by_kind.entry(err.kind.as_str()).or_default() += 1;
            }
            let counts = by_kind
                .iter()
                .map(|(kind, n)| format!("{kind}={n}"))
                .collect::<Vec<_>>()
                .join(", ");
            let listed = self
                .recipient_errors
                .iter()
                .take(MAX_LISTED_FAILURES)
                .map(|e| format!("{} ({}: {})", e.recipient, e.kind.as_str(), e.message))
                .collect::<Vec<_>>()
                .join("; ");
            let more = self.recipient_errors.len().saturating_sub(MAX_LISTED_FAILURES);
            let suffix = if more > 0 {
                format!("; and {more} more")
            } else {
                String::new()
            };

            rows.push(self.row(
                CampaignErrorType::RecipientFailure,
                format!(
                    "{} of {} recipients failed [{counts}]: {listed}{suffix}",
                    self.recipient_errors.len(),
                    self.recipients
                ),
            ));
        }

        if !self.usage_warnings.is_empty() {
            rows.push(self.row(CampaignErrorType::UsageUpdate, self.usage_warnings.join("; ")));
        }

        if !self.batch_panics.is_empty() {
            rows.push(self.row(CampaignErrorType::BatchPanic, self.batch_panics.join("; ")));
        }

        rows
    }

    fn row(&self, kind: CampaignErrorType, message: String) -> CampaignError {
        CampaignError::new(self.campaign_id, self.company_id, kind.as_str(), message)
    }
}
