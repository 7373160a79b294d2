//! Reconciles ad-server delivery exports against creative metadata.
//!
//! Delivery reports are located and parsed tolerantly ([`parse`]), merged
//! and deduplicated ([`merge`]), joined by placement id against the
//! creative metadata search text ([`reconcile`]), labelled ([`classify`])
//! and written out deduplicated ([`finalize`]). [`pipeline`] wires the
//! stages for the command-line runner.

pub mod classify;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod finalize;
pub mod merge;
pub mod metadata;
pub mod output;
pub mod parse;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod source;

pub use config::Config;
pub use error::{FileRejection, PipelineError, Result, RowDrop};
pub use merge::{DeliveryRecord, MergeOutcome, MergeStatus, RawReport};
pub use metadata::CreativeMetadataRecord;
pub use reconcile::{ReconciledRecord, NOT_FOUND_LABEL};
