//! Outbound mail: message building, transports and content screening.

pub mod safety;
pub mod transport;

use std::sync::LazyLock;

use regex::Regex;

pub use safety::{ContentAnalyzer, HeuristicContentAnalyzer, SafetyReport};
pub use transport::{
    InMemoryMailTransport, MailError, MailRequest, MailTransport, SmtpCredentials,
    SmtpMailTransport, build_message, compose,
};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
        .expect("email pattern compiles")
});

/// Syntactic address check applied before any send attempt.
pub fn is_valid_email(address: &str) -> bool {
    address.len() <= 254 && EMAIL_RE.is_match(address)
}

/// Lower-cased domain part of `address`.
pub fn domain_of(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}
