//! JSON containment filters for stored values

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Matches values that contain this JSON document.
///
/// Objects match when every filter field is contained in the value's field
/// of the same name, arrays when every filter element is contained in some
/// value element, and scalars by equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueFilter(Value);

impl ValueFilter {
    pub fn new(filter: Value) -> Self {
        Self(filter)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn matches(&self, value: &Value) -> bool {
        contains(value, &self.0)
    }
}

impl From<Value> for ValueFilter {
    fn from(filter: Value) -> Self {
        Self(filter)
    }
}

fn contains(value: &Value, filter: &Value) -> bool {
    match (value, filter) {
        (Value::Object(value), Value::Object(filter)) => filter
            .iter()
            .all(|(k, f)| value.get(k).is_some_and(|v| contains(v, f))),
        (Value::Array(value), Value::Array(filter)) => filter
            .iter()
            .all(|f| value.iter().any(|v| contains(v, f))),
        _ => value == filter,
    }
}
