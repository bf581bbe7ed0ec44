//! Open/click/unsubscribe tracking injected into campaign HTML.

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use thiserror::Error;
use url::Url;

use mailforge_core::CampaignId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("invalid tracking base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("failed to rewrite html: {0}")]
    Rewrite(String),
}

/// Rewrites campaign HTML per recipient.
#[derive(Debug, Clone)]
pub struct TrackingInjector {
    base: Url,
}

impl TrackingInjector {
    pub fn new(base_url: &str) -> Result<Self, TrackingError> {
        let invalid = |reason: String| TrackingError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason,
        };
        let base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("expected an http(s) url".into()));
        }
        Ok(Self { base })
    }

    fn endpoint(&self, segment: &str, campaign_id: CampaignId, recipient: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(segment);
        }
        url.query_pairs_mut()
            .append_pair("c", &campaign_id.to_string())
            .append_pair("r", recipient);
        url
    }

    pub fn open_url(&self, campaign_id: CampaignId, recipient: &str) -> String {
        self.endpoint("open", campaign_id, recipient).into()
    }

    pub fn click_url(&self, campaign_id: CampaignId, recipient: &str, target: &str) -> String {
        let mut url = self.endpoint("click", campaign_id, recipient);
        url.query_pairs_mut().append_pair("u", target);
        url.into()
    }

    pub fn unsubscribe_url(&self, campaign_id: CampaignId, recipient: &str) -> String {
        self.endpoint("unsubscribe", campaign_id, recipient).into()
    }

    fn is_tracked(&self, href: &str) -> bool {
        href.starts_with(self.base.as_str())
    }

    /// Add the open pixel and unsubscribe footer, and route every trackable
    /// link through the click endpoint.
    ///
    /// Content without a `<body>` element gets the pixel and footer appended
    /// at the end.
    pub fn inject(
        &self,
        html: &str,
        campaign_id: CampaignId,
        recipient: &str,
    ) -> Result<String, TrackingError> {
        let trailer = format!(
            concat!(
                r#"<img src="{}" width="1" height="1" alt="" style="display:none" />"#,
                r#"<p style="font-size:12px;color:#888888;text-align:center">"#,
                r#"<a href="{}">Unsubscribe</a></p>"#
            ),
            self.open_url(campaign_id, recipient),
            self.unsubscribe_url(campaign_id, recipient)
        );
        let mut body_seen = false;

        let rewritten = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![
                    element!("a[href]", |el| {
                        if let Some(href) = el.get_attribute("href") {
                            let target = href.trim();
                            if should_track(target) && !self.is_tracked(target) {
                                el.set_attribute(
                                    "href",
                                    &self.click_url(campaign_id, recipient, target),
                                )?;
                            }
                        }
                        Ok(())
                    }),
                    element!("body", |el| {
                        body_seen = true;
                        el.append(&trailer, ContentType::Html);
                        Ok(())
                    }),
                ],
                ..RewriteStrSettings::default()
            },
        )
        .map_err(|e| TrackingError::Rewrite(e.to_string()))?;

        if body_seen {
            Ok(rewritten)
        } else {
            Ok(rewritten + &trailer)
        }
    }
}

fn should_track(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    !(href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:"))
}
