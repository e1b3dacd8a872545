// Submit result envelope shared by every submit-* operation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable result codes across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum SubmitCode {
    Failure,
    Success,
    BannedPrompt,
    ValidationError,
    NotFound,
    Existed,
    InQueue,
}

impl From<SubmitCode> for i32 {
    fn from(code: SubmitCode) -> i32 {
        match code {
            SubmitCode::Failure => 0,
            SubmitCode::Success => 1,
            SubmitCode::BannedPrompt => 2,
            SubmitCode::ValidationError => 4,
            SubmitCode::NotFound => 9,
            SubmitCode::Existed => 21,
            SubmitCode::InQueue => 22,
        }
    }
}

impl TryFrom<i32> for SubmitCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SubmitCode::Failure),
            1 => Ok(SubmitCode::Success),
            2 => Ok(SubmitCode::BannedPrompt),
            4 => Ok(SubmitCode::ValidationError),
            9 => Ok(SubmitCode::NotFound),
            21 => Ok(SubmitCode::Existed),
            22 => Ok(SubmitCode::InQueue),
            other => Err(format!("unknown submit code: {other}")),
        }
    }
}

/// Result of a submit-* operation. `result` carries the task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub code: SubmitCode,
    pub description: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl SubmitResult {
    pub fn of(code: SubmitCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            result: String::new(),
            properties: HashMap::new(),
        }
    }

    pub fn success(task_id: impl Into<String>) -> Self {
        Self {
            code: SubmitCode::Success,
            description: "success".to_string(),
            result: task_id.into(),
            properties: HashMap::new(),
        }
    }

    pub fn in_queue(task_id: impl Into<String>, position: usize) -> Self {
        Self {
            code: SubmitCode::InQueue,
            description: format!("queued, position {position}"),
            result: task_id.into(),
            properties: HashMap::new(),
        }
    }

    pub fn existed(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: SubmitCode::Existed,
            description: description.into(),
            result: task_id.into(),
            properties: HashMap::new(),
        }
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::of(SubmitCode::NotFound, description)
    }

    pub fn validation_error(description: impl Into<String>) -> Self {
        Self::of(SubmitCode::ValidationError, description)
    }

    pub fn banned(word: impl Into<String>) -> Self {
        let word = word.into();
        let mut result = Self::of(SubmitCode::BannedPrompt, "prompt contains banned word");
        result.result = word;
        result
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self::of(SubmitCode::Failure, description)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == SubmitCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_as_numbers() {
        let json = serde_json::to_string(&SubmitCode::InQueue).unwrap();
        assert_eq!(json, "22");
        let code: SubmitCode = serde_json::from_str("21").unwrap();
        assert_eq!(code, SubmitCode::Existed);
        assert!(serde_json::from_str::<SubmitCode>("3").is_err());
    }

    #[test]
    fn properties_attach() {
        let result = SubmitResult::existed("task-1", "Waiting for window confirm")
            .with_property("remix", true)
            .with_property("finalPrompt", "a cat");
        assert_eq!(result.properties["remix"], Value::Bool(true));
        assert_eq!(result.result, "task-1");
    }
}
