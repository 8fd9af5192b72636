//! Durable article storage, raw HTML archive, and HTTP fetch utilities for newshound.

mod archive;
mod http;
mod store;

pub use archive::{ArchiveEntry, HtmlArchive};
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use store::{NewsStore, StorageError, UpsertOutcome};

pub const CRATE_NAME: &str = "newshound-storage";
