//! Provenance tagging for raw pipeline inputs.
//!
//! Each input category gets its own wrapper type. Only [`PlotSource`] may be
//! embedded as plot material by the prompt composer; the wrappers have no
//! public constructors, so every value passes through [`isolate`].

use crate::core::error::CompositionError;

pub const DEFAULT_STYLE_REFERENCE: &str = "无特定的文笔参考，请保持人类化的爽剧叙事感。";
pub const DEFAULT_LAYOUT_REFERENCE: &str = "无特定排版模版。";
pub const NO_HISTORY_SENTINEL: &str = "无往期脚本";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    PlotSource,
    StyleReference,
    LayoutReference,
    GenerationHistory,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Provenance::PlotSource => "plot-source",
            Provenance::StyleReference => "style-reference",
            Provenance::LayoutReference => "layout-reference",
            Provenance::GenerationHistory => "generation-history",
        }
    }
}

macro_rules! provenance_text {
    ($name:ident, $provenance:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(String);

        impl $name {
            pub const PROVENANCE: Provenance = $provenance;

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

provenance_text!(PlotSource, Provenance::PlotSource);
provenance_text!(StyleReference, Provenance::StyleReference);
provenance_text!(LayoutReference, Provenance::LayoutReference);
provenance_text!(HistoryContext, Provenance::GenerationHistory);

impl StyleReference {
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_STYLE_REFERENCE
    }
}

impl LayoutReference {
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_LAYOUT_REFERENCE
    }
}

impl HistoryContext {
    pub fn is_empty_history(&self) -> bool {
        self.0 == NO_HISTORY_SENTINEL
    }
}

#[derive(Debug, Clone)]
pub struct IsolatedInputs {
    pub source: PlotSource,
    pub style: StyleReference,
    pub layout: LayoutReference,
    pub history: HistoryContext,
}

impl IsolatedInputs {
    /// Replaces the history slot, keeping the other categories.
    pub fn with_history(&self, history: Option<&str>) -> Self {
        Self {
            history: HistoryContext(or_default(history, NO_HISTORY_SENTINEL)),
            ..self.clone()
        }
    }
}

/// Tags the four raw inputs. Optional inputs that are absent or blank fall
/// back to their neutral defaults; a blank source is rejected.
pub fn isolate(
    source: &str,
    style: Option<&str>,
    layout: Option<&str>,
    history: Option<&str>,
) -> Result<IsolatedInputs, CompositionError> {
    if source.trim().is_empty() {
        return Err(CompositionError::EmptySource);
    }

    Ok(IsolatedInputs {
        source: PlotSource(source.to_string()),
        style: StyleReference(or_default(style, DEFAULT_STYLE_REFERENCE)),
        layout: LayoutReference(or_default(layout, DEFAULT_LAYOUT_REFERENCE)),
        history: HistoryContext(or_default(history, NO_HISTORY_SENTINEL)),
    })
}

fn or_default(value: Option<&str>, default: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_source_is_rejected() {
        assert_eq!(isolate("", None, None, None).unwrap_err(), CompositionError::EmptySource);
        assert_eq!(isolate("  \n\t", Some("style"), None, None).unwrap_err(), CompositionError::EmptySource);
    }

    #[test]
    fn test_optional_inputs_fall_back_to_defaults() {
        let inputs = isolate("原著正文", None, Some("   "), None).unwrap();
        assert_eq!(inputs.source.as_str(), "原著正文");
        assert!(inputs.style.is_default());
        assert_eq!(inputs.layout.as_str(), DEFAULT_LAYOUT_REFERENCE);
        assert!(inputs.history.is_empty_history());
    }

    #[test]
    fn test_inputs_pass_through_unchanged() {
        let inputs = isolate("source", Some("  terse  "), Some("【】"), Some("上一集结尾")).unwrap();
        assert_eq!(inputs.style.as_str(), "  terse  ");
        assert_eq!(inputs.layout.as_str(), "【】");
        assert_eq!(inputs.history.as_str(), "上一集结尾");
        assert_eq!(PlotSource::PROVENANCE.label(), "plot-source");
        assert_eq!(HistoryContext::PROVENANCE, Provenance::GenerationHistory);
    }

    #[test]
    fn test_with_history_replaces_only_history() {
        let inputs = isolate("source", Some("style"), None, None).unwrap();
        let next = inputs.with_history(Some("tail"));
        assert_eq!(next.history.as_str(), "tail");
        assert_eq!(next.style.as_str(), "style");
        assert!(inputs.with_history(Some("")).history.is_empty_history());
    }
}
