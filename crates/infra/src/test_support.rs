//! Fixtures shared by unit and integration tests.

use std::sync::OnceLock;

use chrono::{Duration, Utc};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use uuid::Uuid;

use mailforge_core::{Campaign, CampaignId, CampaignStatus, CompanyId, EmailUsageRecord, SendingDomain};

pub(crate) const NEWSLETTER_HTML: &str = r#"<html><body><h1>Spring collection</h1><p>See <a href="https://shop.acme.example/spring">what's new</a>.</p></body></html>"#;

pub(crate) fn campaign(company_id: CompanyId) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: CampaignId::new(),
        company_id,
        name: "Spring newsletter".into(),
        template_id: Some(Uuid::now_v7()),
        subject: "Spring is here".into(),
        html_body: NEWSLETTER_HTML.into(),
        from_email: "news@acme.example".into(),
        from_name: Some("Acme".into()),
        status: CampaignStatus::Draft,
        scheduled_at: None,
        sent_at: None,
        is_archived: false,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn usage(company_id: CompanyId, remaining_emails: i64) -> EmailUsageRecord {
    let now = Utc::now();
    EmailUsageRecord {
        id: Uuid::now_v7(),
        company_id,
        remaining_emails,
        emails_sent: 0,
        period_start: now - Duration::days(1),
        period_end: now + Duration::days(30),
    }
}

pub(crate) fn recipients(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("reader{i}@example.com")).collect()
}

/// PKCS#8 PEM of a 1024-bit RSA key, generated once per test binary.
pub(crate) fn dkim_private_key() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa keygen");
        key.to_pkcs8_pem(LineEnding::LF)
            .expect("pem encoding")
            .as_str()
            .to_owned()
    })
}

pub(crate) fn verified_domain(company_id: CompanyId, domain: &str, private_key: &str) -> SendingDomain {
    SendingDomain {
        company_id,
        domain: domain.into(),
        verified: true,
        dkim_selector: "mf1".into(),
        dkim_private_key: private_key.into(),
    }
}
