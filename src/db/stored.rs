//! Tagged decoding for JSON blobs kept in state rows

use serde::de::DeserializeOwned;

/// Outcome of decoding a persisted blob. Callers fall back to a defined
/// default on `Absent` and `Corrupt` instead of probing fields ad hoc.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored<T> {
    Value(T),
    Absent,
    Corrupt(String),
}

impl<T: DeserializeOwned> Stored<T> {
    pub fn from_json(raw: Option<&str>) -> Self {
        match raw {
            None => Stored::Absent,
            Some(s) if s.trim().is_empty() || s.trim() == "null" => Stored::Absent,
            Some(s) => match serde_json::from_str(s) {
                Ok(v) => Stored::Value(v),
                Err(e) => Stored::Corrupt(e.to_string()),
            },
        }
    }
}

impl<T> Stored<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Stored::Value(v) => Some(v),
            _ => None,
        }
    }
}
