//! Campaign dispatch pipeline.
//!
//! A dispatch checks the campaign's preconditions, moves it to `queued`,
//! splits the recipients into batches that run concurrently, and finally marks
//! the campaign `sent`. Each recipient is validated, screened, tracked, signed
//! when the sending domain allows it, and handed to the mail transport.

pub mod batch;
pub mod pipeline;
pub mod report;
pub mod sender;
pub mod tracking;

pub use batch::{BatchReport, RecipientError, RecipientErrorKind, partition};
pub use pipeline::{CampaignDispatcher, DispatchError};
pub use report::DispatchReport;
pub use sender::{DkimError, DkimKey, ResolvedSender, SigningMode, resolve_sender};
pub use tracking::{TrackingError, TrackingInjector};
