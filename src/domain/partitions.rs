//! Dynamic partition mutation requests and their outcomes.

use serde::{Deserialize, Serialize};

/// A request to mutate a dynamic partitions definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum DynamicPartitionsRequest {
    /// Insert keys that are not already present
    Add {
        partitions_def_name: String,
        partition_keys: Vec<String>,
    },

    /// Remove keys that are currently present
    Delete {
        partitions_def_name: String,
        partition_keys: Vec<String>,
    },
}

impl DynamicPartitionsRequest {
    pub fn add<I, S>(partitions_def_name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Add {
            partitions_def_name: partitions_def_name.into(),
            partition_keys: dedup_keys(keys),
        }
    }

    pub fn delete<I, S>(partitions_def_name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Delete {
            partitions_def_name: partitions_def_name.into(),
            partition_keys: dedup_keys(keys),
        }
    }

    pub fn partitions_def_name(&self) -> &str {
        match self {
            Self::Add {
                partitions_def_name,
                ..
            }
            | Self::Delete {
                partitions_def_name,
                ..
            } => partitions_def_name,
        }
    }

    pub fn partition_keys(&self) -> &[String] {
        match self {
            Self::Add { partition_keys, .. } | Self::Delete { partition_keys, .. } => {
                partition_keys
            }
        }
    }
}

/// Ordered set semantics: keep the first occurrence of each key
fn dedup_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let key = key.into();
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

/// What a partitions request actually changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPartitionsRequestResult {
    pub partitions_def_name: String,

    /// Keys inserted (Add only)
    #[serde(default)]
    pub added_partitions: Option<Vec<String>>,

    /// Keys removed (Delete only)
    #[serde(default)]
    pub deleted_partitions: Option<Vec<String>>,

    /// Keys already in the requested state
    #[serde(default)]
    pub skipped_partitions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let request = DynamicPartitionsRequest::add("customers", ["acme", "globex"]);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["action"], "add");
        assert_eq!(json["partitions_def_name"], "customers");

        let parsed: DynamicPartitionsRequest = serde_json::from_value(serde_json::json!({
            "action": "delete",
            "partitions_def_name": "customers",
            "partition_keys": ["acme"],
        }))
        .unwrap();
        assert!(matches!(parsed, DynamicPartitionsRequest::Delete { .. }));
        assert_eq!(parsed.partition_keys(), ["acme".to_string()]);
    }

    #[test]
    fn test_keys_are_deduplicated_in_order() {
        let request = DynamicPartitionsRequest::add("customers", ["b", "a", "b"]);
        assert_eq!(request.partition_keys(), ["b".to_string(), "a".to_string()]);
    }
}
