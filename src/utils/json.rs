use serde_json::Value;

/// Distinguishes a field left out of a PATCH body from one explicitly cleared.
#[derive(Debug, PartialEq, Eq)]
pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

impl NullableValue {
    /// `None` leaves the column alone, `Some(None)` writes NULL.
    pub fn into_patch(self) -> Option<Option<String>> {
        match self {
            NullableValue::Omitted => None,
            NullableValue::Null => Some(None),
            NullableValue::String(value) => Some(Some(value)),
        }
    }
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

pub fn classify_bool(optional_value: Option<&Value>) -> Result<Option<bool>, String> {
    match optional_value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(other) => Err(format!("expected boolean, got {other}")),
    }
}
