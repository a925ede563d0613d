//! Failure diagnosis and code-fix generation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::runner::TestFailure;
use crate::errors::AnalysisError;
use crate::executor::TaskExecutor;
use crate::util::{extract_json_object, strip_code_fences};

/// Where a failure's fix belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    CodeBug,
    /// The test itself is wrong; never patched by the loop
    TestIssue,
    MissingImplementation,
    ImportError,
}

/// Diagnosis of one failing test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    pub fix_type: FixType,
    #[serde(default)]
    pub fix_location: String,
    #[serde(default)]
    pub fix_suggestion: String,
}

/// AI-backed collaborators of the feedback loop. Both calls may fail; the
/// loop skips the failure in that case.
#[async_trait]
pub trait FailureAnalyst: Send + Sync {
    async fn diagnose_failure(
        &self,
        failure: &TestFailure,
        code: &str,
    ) -> Result<Diagnosis, AnalysisError>;

    /// Full replacement content for the code file.
    async fn generate_fix(
        &self,
        original_code: &str,
        diagnosis: &Diagnosis,
    ) -> Result<String, AnalysisError>;
}

const DIAGNOSE_PROMPT: &str = "\
A test is failing against the code in the context. Diagnose the failure.
Respond with a single JSON object with the keys:
  root_cause      - one sentence
  fix_type        - one of code_bug, test_issue, missing_implementation, import_error
  fix_location    - function or line to change
  fix_suggestion  - what to change";

const FIX_PROMPT: &str = "\
Rewrite the code in the context so the diagnosed failure is fixed.
Return the complete file content in a single fenced code block and nothing else.
Do not change behaviour unrelated to the diagnosis.";

/// [`FailureAnalyst`] that prompts a [`TaskExecutor`].
pub struct AiFailureAnalyst {
    executor: Arc<dyn TaskExecutor>,
    timeout: Duration,
}

impl AiFailureAnalyst {
    pub fn new(executor: Arc<dyn TaskExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

/// Decode a diagnosis from free-form model output.
pub fn parse_diagnosis(output: &str) -> Result<Diagnosis, AnalysisError> {
    let object = extract_json_object(output)
        .ok_or_else(|| AnalysisError::Unparseable("no JSON object in diagnosis".to_string()))?;
    serde_json::from_str(&object).map_err(|e| AnalysisError::Unparseable(e.to_string()))
}

#[async_trait]
impl FailureAnalyst for AiFailureAnalyst {
    async fn diagnose_failure(
        &self,
        failure: &TestFailure,
        code: &str,
    ) -> Result<Diagnosis, AnalysisError> {
        let mut context = Map::new();
        context.insert("failure".to_string(), json!(failure));
        context.insert("code".to_string(), Value::String(code.to_string()));
        let output = self
            .executor
            .execute_task(DIAGNOSE_PROMPT, &context, self.timeout)
            .await?;
        parse_diagnosis(&output)
    }

    async fn generate_fix(
        &self,
        original_code: &str,
        diagnosis: &Diagnosis,
    ) -> Result<String, AnalysisError> {
        let mut context = Map::new();
        context.insert("diagnosis".to_string(), json!(diagnosis));
        context.insert("code".to_string(), Value::String(original_code.to_string()));
        let output = self
            .executor
            .execute_task(FIX_PROMPT, &context, self.timeout)
            .await?;
        let code = strip_code_fences(&output);
        if code.trim().is_empty() {
            return Err(AnalysisError::Unparseable("empty fix".to_string()));
        }
        Ok(format!("{}\n", code.trim_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutorError;

    struct Canned(Result<String, ExecutorError>);

    #[async_trait]
    impl TaskExecutor for Canned {
        async fn execute_task(
            &self,
            _prompt: &str,
            _context: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<String, ExecutorError> {
            self.0.clone()
        }
    }

    fn analyst(reply: Result<String, ExecutorError>) -> AiFailureAnalyst {
        AiFailureAnalyst::new(Arc::new(Canned(reply)), Duration::from_secs(5))
    }

    fn failure() -> TestFailure {
        TestFailure {
            test_name: "test_add".into(),
            error_message: "assert 3 == 4".into(),
            traceback: String::new(),
        }
    }

    #[test]
    fn parse_diagnosis_from_chatty_output() {
        let out = "Sure!\n```json\n{\"root_cause\": \"off by one\", \"fix_type\": \"code_bug\", \"fix_location\": \"add\"}\n```";
        let d = parse_diagnosis(out).unwrap();
        assert_eq!(d.fix_type, FixType::CodeBug);
        assert_eq!(d.fix_location, "add");
        assert!(d.fix_suggestion.is_empty());
    }

    #[test]
    fn parse_diagnosis_rejects_unknown_fix_type() {
        let out = "{\"root_cause\": \"x\", \"fix_type\": \"magic\"}";
        assert!(matches!(parse_diagnosis(out), Err(AnalysisError::Unparseable(_))));
        assert!(parse_diagnosis("no json here").is_err());
    }

    #[tokio::test]
    async fn diagnose_uses_executor_output() {
        let a = analyst(Ok(
            "{\"root_cause\": \"wrong test\", \"fix_type\": \"test_issue\"}".into(),
        ));
        let d = a.diagnose_failure(&failure(), "def add(a, b): return a + b").await.unwrap();
        assert_eq!(d.fix_type, FixType::TestIssue);
    }

    #[tokio::test]
    async fn generate_fix_strips_fences() {
        let a = analyst(Ok("Here you go:\n```python\ndef add(a, b):\n    return a + b\n```\n".into()));
        let d = Diagnosis {
            root_cause: "bug".into(),
            fix_type: FixType::CodeBug,
            fix_location: String::new(),
            fix_suggestion: String::new(),
        };
        let code = a.generate_fix("def add(a, b): return a - b", &d).await.unwrap();
        assert_eq!(code, "def add(a, b):\n    return a + b\n");
    }

    #[tokio::test]
    async fn executor_errors_propagate() {
        let a = analyst(Err(ExecutorError::Failed("down".into())));
        let err = a.diagnose_failure(&failure(), "").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Executor(_)));

        let empty = analyst(Ok("```\n```".into()));
        let d = Diagnosis {
            root_cause: "bug".into(),
            fix_type: FixType::CodeBug,
            fix_location: String::new(),
            fix_suggestion: String::new(),
        };
        assert!(empty.generate_fix("x", &d).await.is_err());
    }
}
