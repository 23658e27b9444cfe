use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::store::Row;
use crate::tokens::TokenSigner;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// One committed mutation, as visible to delta readers.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub set: String,
    pub operation: ChangeOperation,
    pub key: Row,
    /// Post-image for creates/updates; None for deletes (tombstone).
    pub snapshot: Option<Row>,
    pub timestamp: DateTime<Utc>,
}

struct LogState {
    records: VecDeque<ChangeRecord>,
    next_sequence: u64,
}

/// Append-only change log with a strictly monotonic per-service sequence.
/// The append path holds one lock so sequence order equals log order.
pub struct ChangeTracker {
    enabled: bool,
    state: Mutex<LogState>,
}

impl ChangeTracker {
    pub fn new(enabled: bool) -> Self {
        ChangeTracker {
            enabled,
            state: Mutex::new(LogState {
                records: VecDeque::new(),
                next_sequence: 1,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Append one committed mutation. Returns the assigned sequence, or None
    /// when tracking is disabled.
    pub fn record(
        &self,
        set: &str,
        operation: ChangeOperation,
        key: Row,
        snapshot: Option<Row>,
    ) -> Option<ChangeRecord> {
        if !self.enabled {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let record = ChangeRecord {
            sequence,
            set: set.to_string(),
            operation,
            key,
            snapshot,
            timestamp: Utc::now(),
        };
        state.records.push_back(record.clone());
        Some(record)
    }

    /// The sequence a delta token handed out right now would mark.
    pub fn current_sequence(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_sequence - 1
    }

    /// Changes for one set strictly after `since`, bounded by the top of the
    /// log at the time of the call.
    pub fn changes_since(&self, set: &str, since: u64) -> Vec<ChangeRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .iter()
            .filter(|r| r.sequence > since && r.set == set)
            .cloned()
            .collect()
    }

    /// Drop records at or below the oldest live token sequence. Tombstones
    /// stay until every live token has passed them.
    pub fn compact(&self, oldest_live: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state
            .records
            .front()
            .is_some_and(|r| r.sequence <= oldest_live)
        {
            state.records.pop_front();
        }
    }

    /// Rehydrate the sequence counter from persisted change-log rows.
    pub fn restore_sequence(&self, highest_persisted: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.next_sequence <= highest_persisted {
            state.next_sequence = highest_persisted + 1;
        }
    }
}

/// Wire form of a delta token: the signed current sequence.
pub fn encode_delta_token(signer: &TokenSigner, sequence: u64) -> String {
    signer.sign(&serde_json::json!({ "seq": sequence }).to_string())
}

pub fn decode_delta_token(signer: &TokenSigner, token: &str) -> Result<u64> {
    let payload = signer
        .verify(token)
        .ok_or_else(|| Error::validation("invalid $deltatoken"))?;
    let parsed: serde_json::Value =
        serde_json::from_str(&payload).map_err(|_| Error::validation("invalid $deltatoken"))?;
    parsed
        .get("seq")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::validation("invalid $deltatoken"))
}

/// Row shape for the optional persisted change-log relation.
pub fn change_log_row(record: &ChangeRecord) -> Row {
    let mut row = Row::new();
    row.insert("sequence".into(), Value::Int(record.sequence as i64));
    row.insert("entity_set".into(), Value::String(record.set.clone()));
    row.insert(
        "operation".into(),
        Value::String(record.operation.as_str().into()),
    );
    row.insert(
        "entity_key".into(),
        Value::String(
            serde_json::Value::Object(
                record
                    .key
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            )
            .to_string(),
        ),
    );
    row.insert(
        "payload".into(),
        match &record.snapshot {
            Some(snapshot) => Value::String(
                serde_json::Value::Object(
                    snapshot
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect(),
                )
                .to_string(),
            ),
            None => Value::Null,
        },
    );
    row.insert(
        "recorded_at".into(),
        Value::DateTime(record.timestamp.fixed_offset()),
    );
    row
}
