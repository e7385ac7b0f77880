use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::hash64;
use crate::stream_name::cardinal_id;
use crate::{Error, Result};

/// Metadata field consulted by the correlation filter.
pub const CORRELATION_FIELD: &str = "correlationStreamName";

/// One member of a consumer group partitioning a category.
///
/// A message belongs to member `m` of a group of `size` members iff
/// `hash64(cardinal_id(stream)) % size == m`. Streams without a cardinal ID
/// hash the empty string, so they all land on the same member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroup {
    pub member: u64,
    pub size: u64,
}

impl ConsumerGroup {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::invalid_request("consumer group size must be at least 1"));
        }
        if self.member >= self.size {
            return Err(Error::invalid_request(format!(
                "consumer group member {} out of range for size {}",
                self.member, self.size
            )));
        }
        Ok(())
    }

    pub fn includes(&self, stream_name: &str) -> bool {
        hash64(cardinal_id(stream_name)) % self.size == self.member
    }
}

/// Server-side filters for category reads.
///
/// Applied identically by every backend: the storage layer scans by category
/// and global position, and rows are admitted through this predicate, so the
/// partition function cannot drift between drivers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryFilter {
    /// Prefix match against `metadata.correlationStreamName`.
    pub correlation: Option<String>,
    pub consumer_group: Option<ConsumerGroup>,
}

impl CategoryFilter {
    pub fn validate(&self) -> Result<()> {
        if let Some(group) = &self.consumer_group {
            group.validate()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.correlation.is_none() && self.consumer_group.is_none()
    }

    pub fn matches(&self, stream_name: &str, metadata: Option<&Value>) -> bool {
        if let Some(correlation) = &self.correlation {
            let correlated = metadata
                .and_then(|meta| meta.get(CORRELATION_FIELD))
                .and_then(Value::as_str)
                .is_some_and(|value| value.starts_with(correlation.as_str()));
            if !correlated {
                return false;
            }
        }

        if let Some(group) = &self.consumer_group {
            if !group.includes(stream_name) {
                return false;
            }
        }

        true
    }
}
