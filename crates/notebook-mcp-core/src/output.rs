//! Execution output types, shaped like nbformat outputs.

use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mime-type keyed payload (`text/plain`, `image/png`, ...).
pub type MimeBundle = Map<String, Value>;

lazy_static! {
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ANSI escape regex");
}

/// Strip ANSI escape sequences (kernel tracebacks are coloured).
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Which stream a text output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A typed unit of execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Text written to stdout/stderr
    Stream {
        /// Stream name
        name: StreamName,
        /// Text chunk
        text: String,
    },
    /// Rich display payload
    DisplayData {
        /// Mime bundle
        data: MimeBundle,
        /// Display metadata
        #[serde(default)]
        metadata: MimeBundle,
    },
    /// Value of the final expression of a cell
    ExecuteResult {
        /// Execution counter the result belongs to
        #[serde(default)]
        execution_count: Option<u32>,
        /// Mime bundle
        data: MimeBundle,
        /// Display metadata
        #[serde(default)]
        metadata: MimeBundle,
    },
    /// Raised exception; terminates the output sequence
    Error {
        /// Exception class name
        ename: String,
        /// Exception message
        evalue: String,
        /// Traceback lines (may contain ANSI codes)
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    /// Stdout text chunk.
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    /// Stderr text chunk.
    pub fn stderr(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }

    /// Plain-text execute result.
    pub fn plain_result(execution_count: Option<u32>, text: impl Into<String>) -> Self {
        let mut data = MimeBundle::new();
        data.insert("text/plain".into(), Value::String(text.into()));
        Output::ExecuteResult {
            execution_count,
            data,
            metadata: MimeBundle::new(),
        }
    }

    /// nbformat `output_type` of this output.
    pub fn output_type(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::DisplayData { .. } => "display_data",
            Output::ExecuteResult { .. } => "execute_result",
            Output::Error { .. } => "error",
        }
    }

    /// Whether this output ends the sequence for its execution.
    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }

    /// Mime bundle of display and result outputs.
    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Single string rendering, readable by an agent.
    pub fn render(&self) -> String {
        match self {
            Output::Stream { text, .. } => text.clone(),
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                if let Some(text) = data.get("text/plain") {
                    mime_text(text)
                } else if data.contains_key("text/html") {
                    "[HTML Output]".to_string()
                } else if data.contains_key("image/png") {
                    "[Image Output (PNG)]".to_string()
                } else {
                    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
                    format!("[{} Data: keys={:?}]", self.output_type(), keys)
                }
            }
            Output::Error { traceback, ename, evalue } => {
                if traceback.is_empty() {
                    format!("{ename}: {evalue}")
                } else {
                    strip_ansi(&traceback.join("\n"))
                }
            }
        }
    }
}

/// Mime values are either a string or a list of lines.
pub(crate) fn mime_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().filter_map(Value::as_str).collect(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn bundle(value: Value) -> MimeBundle {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_render_stream() {
        assert_eq!(Output::stdout("hello\n").render(), "hello\n");
    }

    #[test]
    fn test_render_plain_result() {
        assert_eq!(Output::plain_result(Some(1), "2").render(), "2");
    }

    #[test]
    fn test_render_multiline_mime_text() {
        let output = Output::DisplayData {
            data: bundle(json!({"text/plain": ["a\n", "b"]})),
            metadata: MimeBundle::new(),
        };
        assert_eq!(output.render(), "a\nb");
    }

    #[test]
    fn test_render_html_and_png() {
        let html = Output::DisplayData {
            data: bundle(json!({"text/html": "<b>x</b>"})),
            metadata: MimeBundle::new(),
        };
        assert_eq!(html.render(), "[HTML Output]");

        let png = Output::DisplayData {
            data: bundle(json!({"image/png": "iVBOR..."})),
            metadata: MimeBundle::new(),
        };
        assert_eq!(png.render(), "[Image Output (PNG)]");
    }

    #[test]
    fn test_render_unknown_mime() {
        let output = Output::DisplayData {
            data: bundle(json!({"application/json": {"a": 1}})),
            metadata: MimeBundle::new(),
        };
        assert_eq!(
            output.render(),
            "[display_data Data: keys=[\"application/json\"]]"
        );
    }

    #[test]
    fn test_render_error_strips_ansi() {
        let output = Output::Error {
            ename: "ValueError".into(),
            evalue: "x".into(),
            traceback: vec![
                "\u{1b}[0;31mValueError\u{1b}[0m: x".into(),
                "line 1".into(),
            ],
        };
        assert_eq!(output.render(), "ValueError: x\nline 1");
        assert!(output.is_error());
    }

    #[test]
    fn test_render_error_without_traceback() {
        let output = Output::Error {
            ename: "KeyError".into(),
            evalue: "'k'".into(),
            traceback: vec![],
        };
        assert_eq!(output.render(), "KeyError: 'k'");
    }

    #[test]
    fn test_nbformat_shape() {
        let json = serde_json::to_value(Output::stderr("warn")).unwrap();
        assert_eq!(json, json!({"output_type": "stream", "name": "stderr", "text": "warn"}));

        let parsed: Output = serde_json::from_value(json!({
            "output_type": "execute_result",
            "execution_count": 3,
            "data": {"text/plain": "42"}
        }))
        .unwrap();
        assert_eq!(parsed, Output::plain_result(Some(3), "42"));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[1;32mok\u{1b}[0m"), "ok");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    proptest! {
        #[test]
        fn prop_strip_ansi_keeps_plain_text(text in "[a-zA-Z0-9 :.]{0,32}") {
            let coloured = format!("\u{1b}[0;31m{text}\u{1b}[0m");
            prop_assert_eq!(strip_ansi(&coloured), text.clone());
            prop_assert_eq!(strip_ansi(&text), text);
        }
    }
}
