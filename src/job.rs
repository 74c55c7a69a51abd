//! The job value object.

use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::QueueResult;

/// A unit of crawl work.
///
/// Two jobs are equal, and hash identically, by `id` alone — the rest of the
/// fields are scheduling metadata, not identity.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub group: Option<String>,
    pub depth: u32,
    pub spider: Option<String>,
    pub priority: i64,
    pub data: Option<Vec<u8>>,
    pub parent: Option<String>,
    pub attempts: u32,
    domain: OnceLock<Option<String>>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Job {
    /// Build a new job. `url` is trimmed and given a `http://` scheme if it
    /// lacks one; `depth` defaults to 0 when omitted.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: ensure_scheme(url.into().trim()),
            group: None,
            depth: 0,
            spider: None,
            priority: 0,
            data: None,
            parent: None,
            attempts: 0,
            domain: OnceLock::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_spider(mut self, spider: impl Into<String>) -> Self {
        self.spider = Some(spider.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Attach caller-defined data, opaque to the scheduler, via `encode`.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> QueueResult<Self> {
        self.data = Some(encode(data)?);
        Ok(self)
    }

    /// The domain part of `url`, derived lazily and cached for the lifetime
    /// of this job value.
    pub fn domain(&self) -> Option<&str> {
        self.domain
            .get_or_init(|| extract_domain(&self.url))
            .as_deref()
    }

    /// Decode `data` back into a caller-defined type, using the codec the
    /// caller encoded it with. The scheduler never calls this itself.
    pub fn decode_data<T: DeserializeOwned>(&self) -> QueueResult<Option<T>> {
        self.data
            .as_deref()
            .map(decode)
            .transpose()
    }
}

/// Stable, opaque encoding for a job's `data` payload. Serde JSON bytes are
/// deterministic enough to round-trip within one persisted store, which is
/// all a caller can rely on.
pub fn encode<T: Serialize>(value: &T) -> QueueResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> QueueResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn ensure_scheme(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Best-effort host extraction. Not a substitute for a real URL/domain
/// library — the full normalization heuristics a crawler wants (stripping
/// `www.`, public-suffix awareness, IDN handling) live outside this crate.
fn extract_domain(url: &str) -> Option<String> {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme);
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    let host = if host.starts_with('[') {
        host.split(']').next().map(|h| format!("{h}]")).unwrap_or_else(|| host.to_string())
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
