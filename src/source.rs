//! Reading source bytes and the collaborators around it.
//!
//! Local files are read directly. Remote URLs go through a [`RemoteFetcher`];
//! the stock [`OfflineFetcher`] refuses every request, so remote sources only
//! work when a real fetcher is injected. An optional [`MetadataExtractor`]
//! enriches results with a loose attribute bag.

use crate::identifier::ResourceIdentifier;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Failure scoped to a single resource. Never affects siblings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("cannot open source: {0}")]
    OpenFailed(String),
    #[error("unsupported image: {0}")]
    UnsupportedFormat(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("encoding failed: {0}")]
    EncodeFailed(String),
}

/// Fetches remote resources.
///
/// Implementations must give up after `timeout` so one slow host cannot
/// stall a worker indefinitely.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, ResourceError>;
}

/// Fetcher for builds without network access.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

impl RemoteFetcher for OfflineFetcher {
    fn fetch(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, ResourceError> {
        Err(ResourceError::FetchFailed(format!(
            "{url}: remote fetching is not configured"
        )))
    }
}

/// Loose metadata attributes (camera, caption, ...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Extracts optional metadata from source bytes. Used only for enrichment:
/// returning `None` never fails a resource.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Option<Metadata>;
}

/// Read the bytes behind an identifier.
pub fn load_bytes(
    resource: &ResourceIdentifier,
    fetcher: &dyn RemoteFetcher,
    timeout: Duration,
) -> Result<Vec<u8>, ResourceError> {
    match resource {
        ResourceIdentifier::Local(path) => std::fs::read(path)
            .map_err(|e| ResourceError::OpenFailed(format!("{}: {}", path.display(), e))),
        ResourceIdentifier::Remote(url) => fetcher.fetch(url, timeout),
    }
}
