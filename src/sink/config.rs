//! Permissive decoding and validation of sink configuration blobs

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Exporter backend used when the blob does not name one
pub const DEFAULT_BACKEND: &str = "prometheus";

const URL_KEY: &str = "url";
const USER_KEY: &str = "user";
const PASSWORD_KEY: &str = "password";
const BACKEND_KEY: &str = "backend";

/// Export configuration of a sink
///
/// Decoding never fails on individual fields: missing or non-string values
/// become empty strings. Whether the result is usable is decided by
/// [`SinkConfig::validate`].
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Every other key of the blob, kept verbatim
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("backend", &self.backend)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl SinkConfig {
    /// Decode a raw JSON blob. Fails only if the blob is not a JSON object.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(blob)?;
        match value {
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(Error::ValidationError(format!(
                "sink config must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode from an already parsed JSON object
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let mut take = |key: &str| match map.remove(key) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };

        let url = take(URL_KEY);
        let user = take(USER_KEY);
        let password = take(PASSWORD_KEY);
        let backend = take(BACKEND_KEY);

        Self {
            url,
            user,
            password,
            backend: if backend.is_empty() {
                default_backend()
            } else {
                backend
            },
            metadata: map,
        }
    }

    /// Decode and validate in one step
    pub fn parse_validated(blob: &[u8]) -> Result<Self> {
        let config = Self::from_blob(blob)?;
        config.validate()?;
        Ok(config)
    }

    /// A usable config has an absolute URL with a host
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::ValidationError("sink config has no url".to_string()));
        }

        let parsed = Url::parse(&self.url)
            .map_err(|e| Error::ValidationError(format!("invalid url {:?}: {e}", self.url)))?;

        if parsed.host_str().is_none() {
            return Err(Error::ValidationError(format!(
                "url {:?} has no host",
                self.url
            )));
        }

        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
