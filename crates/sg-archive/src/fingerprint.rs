use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::model::{CountAndLastUpdated, SetDocument};

/// Content key of an archive: the set's query, its size, and the newest
/// update among its members.
#[derive(Debug, Clone, PartialEq)]
pub struct SetQueryArchiveHashInfo {
    pub sqon: Value,
    pub size: i64,
    pub last_updated: String,
}

impl SetQueryArchiveHashInfo {
    pub fn for_set(set: &SetDocument, aggregation: &CountAndLastUpdated) -> Self {
        Self {
            sqon: set.sqon.clone(),
            size: set.size,
            last_updated: aggregation.last_updated.clone(),
        }
    }

    /// The whole index is keyed like a set whose query matches everything.
    pub fn for_all(aggregation: &CountAndLastUpdated) -> Self {
        Self {
            sqon: json!({ "match_all": {} }),
            size: aggregation.count,
            last_updated: aggregation.last_updated.clone(),
        }
    }

    /// JSON with object keys sorted at every depth. Array order is kept.
    pub fn canonical(&self) -> String {
        let value = json!({
            "sqon": self.sqon,
            "size": self.size,
            "last_updated": self.last_updated,
        });
        let mut out = String::new();
        write_canonical(&value, &mut out);
        out
    }

    /// Hex SHA-256 of [`Self::canonical`].
    pub fn hash(&self) -> String {
        format!("{:x}", Sha256::digest(self.canonical().as_bytes()))
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (position, key) in keys.into_iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn info(sqon: Value, size: i64, last_updated: &str) -> SetQueryArchiveHashInfo {
        SetQueryArchiveHashInfo {
            sqon,
            size,
            last_updated: last_updated.to_string(),
        }
    }

    #[test]
    fn hash_is_stable_across_calls_and_key_order() {
        let a = info(
            serde_json::from_str(r#"{"op":"and","content":[{"op":"in","content":{"field":"study_id","value":["A"]}}]}"#)
                .unwrap(),
            3,
            "t1",
        );
        let b = info(
            serde_json::from_str(r#"{"content":[{"content":{"value":["A"],"field":"study_id"},"op":"in"}],"op":"and"}"#)
                .unwrap(),
            3,
            "t1",
        );
        assert_eq!(a.hash(), a.hash());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn every_field_changes_the_hash() {
        let base = info(json!({"op": "and", "content": []}), 3, "t1");
        let other_query = info(json!({"op": "or", "content": []}), 3, "t1");
        let other_size = info(json!({"op": "and", "content": []}), 4, "t1");
        let other_update = info(json!({"op": "and", "content": []}), 3, "t2");
        assert_ne!(base.hash(), other_query.hash());
        assert_ne!(base.hash(), other_size.hash());
        assert_ne!(base.hash(), other_update.hash());
    }

    #[test]
    fn array_order_is_significant() {
        let first = info(json!({"ids": ["a", "b"]}), 2, "t");
        let second = info(json!({"ids": ["b", "a"]}), 2, "t");
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn set_and_all_fingerprints_use_the_aggregation() {
        let aggregation = CountAndLastUpdated {
            count: 3,
            last_updated: "1700000000000".to_string(),
        };
        let set = SetDocument {
            set_id: Uuid::new_v4(),
            sqon: json!({"op": "and"}),
            size: 3,
        };
        let set_info = SetQueryArchiveHashInfo::for_set(&set, &aggregation);
        assert_eq!(set_info.size, 3);
        assert_eq!(set_info.last_updated, "1700000000000");

        let all_info = SetQueryArchiveHashInfo::for_all(&aggregation);
        assert_eq!(all_info.sqon, json!({"match_all": {}}));
        assert_ne!(set_info.hash(), all_info.hash());
        assert_eq!(
            all_info.canonical(),
            r#"{"last_updated":"1700000000000","size":3,"sqon":{"match_all":{}}}"#
        );
    }
}
