//! Content fingerprints: canonical JSON, per-input hashes, Merkle roots and
//! stable ids derived from content.
//!
//! Hashes are SHA-256. Leaves are tagged `0x00`, interior nodes `0x01`, so a
//! leaf can never collide with an interior node. An unpaired node at the end
//! of a level is promoted unchanged.

use sha2::{Digest, Sha256};

use crate::domain::{JobId, TaskId};

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

const JOB_NAMESPACE: &str = "pacer.job";
const TASK_NAMESPACE: &str = "pacer.task";

/// Serialize with object keys sorted at every depth and no whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Value::String の Display は JSON エスケープ済みの文字列を返す
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Leaf hash of one input.
pub fn hash_input(value: &serde_json::Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(canonical_json(value).as_bytes());
    hasher.finalize().into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle root over an ordered input collection, as 64 lowercase hex chars.
pub fn compute_merkle_root(inputs: &[serde_json::Value]) -> String {
    if inputs.is_empty() {
        return to_hex(&Sha256::digest(b""));
    }

    let mut level: Vec<[u8; 32]> = inputs.iter().map(hash_input).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }
    to_hex(&level[0])
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn derive_bytes(namespace: &str, salt: &str, canonical: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0]);
    hasher.update(salt.as_bytes());
    hasher.update([0]);
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Stable job id from the job's input and a salt (typically `"{task_id}:{index}"`).
pub fn generate_job_id(input: &serde_json::Value, salt: &str) -> JobId {
    JobId::from_bytes(derive_bytes(JOB_NAMESPACE, salt, &canonical_json(input)))
}

/// Stable task id from a name and a salt (the Merkle root for deterministic tasks).
pub fn generate_task_id(name: &str, salt: &str) -> TaskId {
    TaskId::from_bytes(derive_bytes(TASK_NAMESPACE, salt, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"d": [1, {"z": true, "y": null}], "c": "x"}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":"x","d":[1,{"y":null,"z":true}]},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_escapes_keys() {
        let v = json!({"quo\"te": 1});
        assert_eq!(canonical_json(&v), r#"{"quo\"te":1}"#);
    }

    #[test]
    fn root_is_fixed_width_hex() {
        let root = compute_merkle_root(&[json!("a"), json!("b"), json!("c")]);
        assert_eq!(root.len(), 64);
        assert!(root.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let empty = compute_merkle_root(&[]);
        assert_eq!(
            empty,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn root_ignores_key_order_within_inputs() {
        let a = vec![json!({"url": "x", "id": 1}), json!({"k": [1, 2]})];
        let b = vec![json!({"id": 1, "url": "x"}), json!({"k": [1, 2]})];
        assert_eq!(compute_merkle_root(&a), compute_merkle_root(&b));
    }

    #[test]
    fn root_depends_on_order_and_content() {
        let base = vec![json!("a"), json!("b"), json!("c"), json!("d"), json!("e")];
        let root = compute_merkle_root(&base);

        let mut swapped = base.clone();
        swapped.swap(1, 3);
        assert_ne!(compute_merkle_root(&swapped), root);

        let mut changed = base.clone();
        changed[4] = json!("E");
        assert_ne!(compute_merkle_root(&changed), root);

        assert_eq!(compute_merkle_root(&base), root);
    }

    #[test]
    fn duplicating_the_last_item_changes_the_root() {
        let three = vec![json!(1), json!(2), json!(3)];
        let four = vec![json!(1), json!(2), json!(3), json!(3)];
        assert_ne!(compute_merkle_root(&three), compute_merkle_root(&four));
    }

    #[test]
    fn single_input_root_is_its_leaf_hash() {
        let v = json!({"x": 1});
        assert_eq!(compute_merkle_root(&[v.clone()]), to_hex(&hash_input(&v)));
    }

    #[test]
    fn derived_ids_are_stable_and_salted() {
        let input = json!({"b": 2, "a": 1});
        let reordered = json!({"a": 1, "b": 2});

        assert_eq!(generate_job_id(&input, "t:0"), generate_job_id(&reordered, "t:0"));
        assert_ne!(generate_job_id(&input, "t:0"), generate_job_id(&input, "t:1"));

        assert_eq!(generate_task_id("crawl", "root"), generate_task_id("crawl", "root"));
        assert_ne!(generate_task_id("crawl", "root"), generate_task_id("crawl", "other"));
    }
}
