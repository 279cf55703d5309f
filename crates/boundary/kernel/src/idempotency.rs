use boundary_types::{CorrelationId, IdempotencyKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

const DOMAIN: &[u8] = b"boundary-idempotency-v1:";

/// Computes the canonical idempotency key of a request.
///
/// The key covers the operation name and the payload. Payloads are
/// canonicalized first (object keys sorted, no insignificant whitespace), so
/// two payloads that differ only in key order or formatting share a key.
/// Pure: no state, no I/O.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdempotencyKeyDeriver;

impl IdempotencyKeyDeriver {
    pub fn derive(operation: &str, payload: &Value) -> IdempotencyKey {
        let canonical = Self::canonicalize(payload);

        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN);
        hasher.update(&(operation.len() as u64).to_le_bytes());
        hasher.update(operation.as_bytes());
        hasher.update(canonical.as_bytes());
        IdempotencyKey::from_hash(hasher.finalize())
    }

    /// Parse `json` and derive its key.
    pub fn derive_from_str(operation: &str, json: &str) -> Result<IdempotencyKey, serde_json::Error> {
        let payload: Value = serde_json::from_str(json)?;
        Ok(Self::derive(operation, &payload))
    }

    /// Canonical JSON text of a value.
    pub fn canonicalize(value: &Value) -> String {
        let mut out = String::new();
        write_canonical(value, &mut out);
        out
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json's string escaping is deterministic
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str("\"\""),
    }
}

/// Idempotency keys held by crossings that have not finished.
///
/// The idempotency gate reserves a key before consulting the ledger; the
/// context releases it when the crossing commits or faults. At most one live
/// crossing holds a given key.
#[derive(Debug, Default)]
pub struct InFlightKeys {
    held: DashMap<IdempotencyKey, CorrelationId>,
}

impl InFlightKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key` for `holder`. Returns the other crossing holding it.
    pub fn reserve(&self, key: IdempotencyKey, holder: CorrelationId) -> Result<(), CorrelationId> {
        match self.held.entry(key) {
            Entry::Occupied(entry) if *entry.get() != holder => Err(*entry.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(holder);
                Ok(())
            }
        }
    }

    /// Drop the reservation if `holder` still owns it.
    pub fn release(&self, key: &IdempotencyKey, holder: &CorrelationId) -> bool {
        let released = self.held.remove_if(key, |_, h| h == holder).is_some();
        if released {
            debug!(correlation_id = %holder, key = %key, "idempotency key released");
        }
        released
    }

    pub fn holder(&self, key: &IdempotencyKey) -> Option<CorrelationId> {
        self.held.get(key).map(|h| *h)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
