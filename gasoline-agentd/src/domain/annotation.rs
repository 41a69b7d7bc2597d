use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

/// One rectangle drawn by the user, with the note they typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Annotations from a single draw-mode pass over one tab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSession {
    pub tab_id: i64,
    #[serde(default)]
    pub page_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Several per-page sessions collected under one caller-chosen name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedAnnotationSession {
    pub name: String,
    #[serde(default)]
    pub pages: Vec<AnnotationSession>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NamedAnnotationSession {
    pub fn annotation_count(&self) -> usize {
        self.pages.iter().map(|page| page.annotations.len()).sum()
    }
}

/// Full DOM/style/a11y information for an annotated element. Only the
/// fields the daemon reads are typed; everything else rides along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDetail {
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub a11y_flags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome delivered to a caller waiting on a draw-mode correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationCompletion {
    Session(AnnotationSession),
    Named(NamedAnnotationSession),
}

impl AnnotationCompletion {
    pub fn to_value(&self) -> Value {
        match self {
            AnnotationCompletion::Session(session) => {
                serde_json::to_value(session).unwrap_or(Value::Null)
            }
            AnnotationCompletion::Named(named) => {
                serde_json::to_value(named).unwrap_or(Value::Null)
            }
        }
    }
}
