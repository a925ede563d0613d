//! Shared utility functions for the pipewright crate.

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Return the body of the first fenced code block, or the trimmed text when
/// there is no fence.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    // Skip the language tag on the opening fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

/// Truncate `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}... [truncated]", cut)
}

/// Serde helpers for `Duration` stored as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for `Option<Duration>` stored as fractional seconds.
pub mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_surrounding_text() {
        let text = r#"Diagnosis follows: {"root_cause": "x"} hope that helps"#;
        assert_eq!(extract_json_object(text), Some(r#"{"root_cause": "x"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"outer": {"inner": "value"}}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_strip_code_fences_with_language() {
        let text = "Here is the fix:\n```python\ndef add(a, b):\n    return a + b\n```\nDone.";
        assert_eq!(strip_code_fences(text), "def add(a, b):\n    return a + b");
    }

    #[test]
    fn test_strip_code_fences_without_fence() {
        assert_eq!(strip_code_fences("  x = 1\n"), "x = 1");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc... [truncated]");
    }

    #[test]
    fn test_duration_secs_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_secs")]
            d: std::time::Duration,
            #[serde(default, with = "opt_duration_secs")]
            o: Option<std::time::Duration>,
        }

        let w: Wrapper = serde_json::from_str(r#"{"d": 1.5, "o": 2}"#).unwrap();
        assert_eq!(w.d, std::time::Duration::from_millis(1500));
        assert_eq!(w.o, Some(std::time::Duration::from_secs(2)));

        let w: Wrapper = serde_json::from_str(r#"{"d": 0}"#).unwrap();
        assert!(w.o.is_none());

        assert!(serde_json::from_str::<Wrapper>(r#"{"d": -1}"#).is_err());
        assert!(serde_json::from_str::<Wrapper>(r#"{"d": 1e30}"#).is_err());
        assert!(serde_json::from_str::<Wrapper>(r#"{"d": 1, "o": 1e30}"#).is_err());
    }
}
