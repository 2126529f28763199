//! Snapshot payload validation against the bundled JSON schema.

use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use serde_json::Value;

use crate::core::types::SnapshotPayload;
use crate::error::{LedgerError, LedgerResult};

const PAYLOAD_SCHEMA: &str = include_str!("../../schemas/snapshot_payload.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(PAYLOAD_SCHEMA).expect("snapshot payload schema should be JSON");
    validator_for(&schema).expect("snapshot payload schema should compile")
});

/// Validate an untyped payload and convert it.
///
/// All schema violations are reported together, separated by `; `.
pub fn parse_payload(value: &Value) -> LedgerResult<SnapshotPayload> {
    if !VALIDATOR.is_valid(value) {
        let messages = VALIDATOR
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(LedgerError::InvalidInput(format!(
            "snapshot payload schema validation failed: {}",
            messages.join("; ")
        )));
    }
    serde_json::from_value(value.clone())
        .map_err(|err| LedgerError::InvalidInput(format!("snapshot payload: {err}")))
}

/// Parse payload JSON text; an empty string is the empty payload.
pub fn parse_payload_str(raw: &str) -> LedgerResult<SnapshotPayload> {
    if raw.trim().is_empty() {
        return Ok(SnapshotPayload::default());
    }
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| LedgerError::InvalidInput(format!("snapshot payload is not JSON: {err}")))?;
    parse_payload(&value)
}
