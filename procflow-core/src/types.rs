use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Execution (token) id. The root execution's id doubles as the
/// process-instance id.
pub type ExecutionId = Uuid;

/// Job id.
pub type JobId = Uuid;

// ─── Value ────────────────────────────────────────────────────

/// A process variable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Json(v) => !v.is_null(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
