//! Deterministic cache keys for node invocations.
//!
//! A fingerprint is the SHA-256 of a canonical JSON document made of the
//! node's capability tag, its role configuration, its declared output ports
//! and the resolved input values. Canonical form sorts object keys and drops
//! whitespace, so key order in the workflow file or in upstream outputs never
//! changes the key. Run identity, timestamps and retry settings are excluded.

use serde_json::Value;
use sha2::{Digest, Sha256};

use agentflow_core::types::{Fingerprint, Outputs};
use agentflow_core::workflow::NodeDefinition;

const FINGERPRINT_SCHEMA: u32 = 1;

/// Optional `(workflow id, version)` mixed into every key.
#[derive(Debug, Clone, Copy)]
pub struct VersionScope<'a> {
    pub workflow_id: &'a str,
    pub version: u32,
}

/// Fingerprint a node against its resolved inputs.
pub fn fingerprint(node: &NodeDefinition, inputs: &Outputs) -> Fingerprint {
    fingerprint_scoped(node, inputs, None)
}

/// Fingerprint with an optional version scope, for strict per-version caching.
pub fn fingerprint_scoped(
    node: &NodeDefinition,
    inputs: &Outputs,
    scope: Option<VersionScope<'_>>,
) -> Fingerprint {
    let role = serde_json::to_value(&node.role).unwrap_or(Value::Null);
    let mut outputs = node.outputs.clone();
    outputs.sort();

    let mut doc = serde_json::json!({
        "schema": FINGERPRINT_SCHEMA,
        "capability": node.role.capability(),
        "role": role,
        "outputs": outputs,
        "inputs": Value::Object(inputs.clone()),
    });
    if let (Some(scope), Value::Object(map)) = (scope, &mut doc) {
        map.insert(
            "scope".into(),
            serde_json::json!({ "workflow": scope.workflow_id, "version": scope.version }),
        );
    }

    let canonical = canonical_json(&doc);
    Fingerprint(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Serialize a value with sorted object keys and no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
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
