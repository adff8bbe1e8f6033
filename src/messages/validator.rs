//! JSON schema validation of message payloads.
//!
//! One schema file per (action, direction) pair, loaded from a configured
//! directory at startup: `<Action>.json` for requests and
//! `<Action>Response.json` for responses. Loading fails fast when a file
//! for a required action is missing so a misconfigured deployment is
//! caught at boot instead of on the first message.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadDirection {
    Request,
    Response,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("schema file not found: {0}")]
    MissingSchema(PathBuf),
    #[error("could not read schema file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("schema file {path} is not valid JSON: {source}")]
    InvalidJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("schema file {path} is not a valid JSON schema: {message}")]
    InvalidSchema { path: PathBuf, message: String },
}

/// Registry of compiled validators keyed by (action, direction).
#[derive(Debug)]
pub struct MessagesValidator {
    validators: HashMap<(String, PayloadDirection), JSONSchema>,
}

impl MessagesValidator {
    /// Load and compile the schemas for every action in `actions`.
    pub fn load(
        schemas_dir: impl AsRef<Path>,
        actions: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Self, ValidatorError> {
        let dir = schemas_dir.as_ref();
        let mut validators = HashMap::new();

        for action in actions {
            let action = action.as_ref();
            for (direction, file_name) in [
                (PayloadDirection::Request, format!("{action}.json")),
                (PayloadDirection::Response, format!("{action}Response.json")),
            ] {
                let path = dir.join(&file_name);
                let schema = compile(&path)?;
                validators.insert((action.to_string(), direction), schema);
            }
        }

        debug!(
            dir = %dir.display(),
            count = validators.len(),
            "Message schemas loaded"
        );

        Ok(Self { validators })
    }

    /// An empty registry: every payload passes.
    ///
    /// Used by roles configured without a schemas directory and by tests
    /// that exercise dispatch logic only.
    pub fn permissive() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    pub fn has_schema(&self, action: &str, direction: PayloadDirection) -> bool {
        self.validators
            .contains_key(&(action.to_string(), direction))
    }

    /// Validate `payload`; `Ok(())` when no schema is registered for the key.
    pub fn validate(
        &self,
        action: &str,
        direction: PayloadDirection,
        payload: &Value,
    ) -> Result<(), Vec<String>> {
        let Some(schema) = self.validators.get(&(action.to_string(), direction)) else {
            return Ok(());
        };
        schema
            .validate(payload)
            .map_err(|errors| errors.map(|e| e.to_string()).collect())
    }
}

fn compile(path: &Path) -> Result<JSONSchema, ValidatorError> {
    if !path.exists() {
        return Err(ValidatorError::MissingSchema(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ValidatorError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value =
        serde_json::from_str(&text).map_err(|source| ValidatorError::InvalidJson {
            path: path.to_path_buf(),
            source,
        })?;
    JSONSchema::compile(&value).map_err(|e| ValidatorError::InvalidSchema {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_schema(dir: &Path, name: &str, schema: &Value) {
        std::fs::write(dir.join(name), serde_json::to_string(schema).unwrap()).unwrap();
    }

    fn heartbeat_schemas(dir: &Path) {
        write_schema(
            dir,
            "Heartbeat.json",
            &serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {}
            }),
        );
        write_schema(
            dir,
            "HeartbeatResponse.json",
            &serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "currentTime": { "type": "string" } },
                "required": ["currentTime"]
            }),
        );
    }

    #[test]
    fn loads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        heartbeat_schemas(dir.path());

        let validator = MessagesValidator::load(dir.path(), ["Heartbeat"]).unwrap();
        assert!(validator.has_schema("Heartbeat", PayloadDirection::Request));

        assert!(validator
            .validate(
                "Heartbeat",
                PayloadDirection::Request,
                &serde_json::json!({})
            )
            .is_ok());

        let errors = validator
            .validate(
                "Heartbeat",
                PayloadDirection::Response,
                &serde_json::json!({}),
            )
            .unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn missing_schema_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = MessagesValidator::load(dir.path(), ["Heartbeat"]).unwrap_err();
        assert!(matches!(err, ValidatorError::MissingSchema(_)));
    }

    #[test]
    fn permissive_accepts_anything() {
        let validator = MessagesValidator::permissive();
        assert!(validator
            .validate(
                "Whatever",
                PayloadDirection::Request,
                &serde_json::json!({"x": 1})
            )
            .is_ok());
    }
}
