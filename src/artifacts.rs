//! Versioned payloads exchanged between stages through session save keys.
//!
//! They persist as plain JSON inside the session so the files stay
//! inspectable, but producers and consumers agree on the shape through these
//! structs instead of ad hoc maps.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::strip_code_fences;

/// A payload stored under a session key with an explicit schema version.
pub trait Artifact: Serialize + DeserializeOwned {
    const VERSION: u32;

    fn version(&self) -> u32;

    /// Decode `value`, rejecting payloads written with another version.
    fn from_value(value: &Value) -> Option<Self> {
        let decoded: Self = serde_json::from_value(value.clone()).ok()?;
        (decoded.version() == Self::VERSION).then_some(decoded)
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Session value for a task's raw output.
///
/// Output that is a single JSON object, bare or inside one code fence, is
/// kept structured so artifact consumers can decode it. Anything else is
/// stored verbatim as a string.
pub fn output_value(output: &str) -> Value {
    let trimmed = output.trim();
    let body = if trimmed.starts_with("```") && trimmed.ends_with("```") {
        strip_code_fences(trimmed)
    } else {
        trimmed.to_string()
    };
    match serde_json::from_str::<Value>(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::String(output.to_string()),
    }
}

/// A single tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Design output describing a tool to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpecification {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub returns: String,
}

impl ToolSpecification {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            version: Self::VERSION,
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
            returns: String::new(),
        }
    }
}

impl Artifact for ToolSpecification {
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }
}

/// Generated code file plus the test files that exercise it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFileSet {
    pub version: u32,
    pub code_file: PathBuf,
    #[serde(default)]
    pub test_files: Vec<PathBuf>,
    /// Free-form extra information (framework, fixtures…)
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl TestFileSet {
    pub fn new(code_file: impl Into<PathBuf>, test_files: Vec<PathBuf>) -> Self {
        Self {
            version: Self::VERSION,
            code_file: code_file.into(),
            test_files,
            notes: BTreeMap::new(),
        }
    }

    /// (test, code) pairs for the feedback loop.
    pub fn pairs(&self) -> Vec<(PathBuf, PathBuf)> {
        self.test_files
            .iter()
            .map(|t| (t.clone(), self.code_file.clone()))
            .collect()
    }
}

impl Artifact for TestFileSet {
    const VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }
}
