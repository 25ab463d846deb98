//! Persistence for tipster: the relational entity store, raw-page capture
//! and the single-shot HTTP page client.

mod artifacts;
mod entities;
mod http;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use entities::{
    AssignOutcome, BacklogCounts, EntityStore, IngestSummary, NewPrediction, PendingPage, RaceSummary,
    StoreError,
};
pub use http::{
    classify_status, BackoffPolicy, FetchedPage, HttpClientConfig, HttpError, PageClient,
    RetryDisposition,
};

pub const CRATE_NAME: &str = "tipster-storage";
