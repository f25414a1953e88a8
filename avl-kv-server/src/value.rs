use std::fmt;

/// Payload stored under a key.
///
/// The line protocol stores raw text; the JSON protocol stores whatever JSON
/// value the client sent. The tree never looks inside.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Json(serde_json::Value),
}

impl Value {
    /// Size of the payload as it travels on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Value::Text(text) => text.len(),
            Value::Json(json) => json.to_string().len(),
        }
    }
}

/// Renders text verbatim and JSON in compact serialized form.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Json(json) => write!(f, "{json}"),
        }
    }
}
