use chrono::{DateTime, Utc};
use eventodb::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of the namespace registry.
///
/// The registry owns the mapping from namespace id to token hash and data
/// location; message data itself lives in the area `data_location` points
/// at (a schema name for the relational backends, a directory name for the
/// embedded one).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub id: String,
    pub token_hash: String,
    pub data_location: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Validates a namespace id: DNS-label-like, 1–63 chars of `[a-z0-9-]`,
/// with no leading or trailing dash.
pub fn validate_namespace_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 63
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !id.starts_with('-')
        && !id.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(Error::invalid_request(format!(
            "invalid namespace id {id:?}: expected a lowercase DNS label"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_labels() {
        for id in ["default", "tenant-1", "a", "x9", "a-b-c"] {
            assert!(validate_namespace_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_everything_else() {
        for id in ["", "-a", "a-", "UPPER", "under_score", "dotted.name", "spa ce"] {
            assert!(validate_namespace_id(id).is_err(), "{id:?} should be invalid");
        }
        let long = "a".repeat(64);
        assert!(validate_namespace_id(&long).is_err());
    }
}
