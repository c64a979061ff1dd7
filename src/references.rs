//! Reference snippets injected into the prompt for grounding.
//!
//! The pipeline treats retrieved references as an opaque input: anything
//! implementing [`ReferenceProvider`] can supply them. The provider's
//! [`version`](ReferenceProvider::version) is the `rag_version` that cached
//! results are tied to, so changing the reference corpus invalidates them.
//!
//! [`StaticReferences`] is the built-in provider: short per-format
//! checklists of the defects worth reporting.

use crate::models::{FileType, HintKind, ParserHint};

/// One retrieved reference passage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSnippet {
    pub title: String,
    pub text: String,
}

/// Source of reference snippets for a prompt.
pub trait ReferenceProvider: Send + Sync {
    /// Version of the reference corpus (e.g. `"1.0.0"`).
    fn version(&self) -> &str;

    /// Snippets relevant to a file of `file_type` with the given hints.
    fn snippets(&self, file_type: FileType, hints: &[ParserHint]) -> Vec<ReferenceSnippet>;
}

/// Built-in checklists, one per format, plus a note on reading hints.
pub struct StaticReferences {
    version: String,
}

impl StaticReferences {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Default for StaticReferences {
    fn default() -> Self {
        Self::new("1.0.0")
    }
}

fn checklist(file_type: FileType) -> (&'static str, &'static str) {
    match file_type {
        FileType::Json => (
            "JSON defect checklist",
            "- trailing commas, single quotes, unquoted keys, comments (not valid JSON)\n\
             - duplicate keys in one object (later value silently wins)\n\
             - numbers with leading zeros, NaN/Infinity, unescaped control characters\n\
             - inconsistent value types for the same key across array elements\n\
             - suspicious placeholders (\"TODO\", \"null\" as a string, empty required fields)",
        ),
        FileType::Csv => (
            "CSV defect checklist",
            "- rows whose column count differs from the header\n\
             - unbalanced or stray double quotes; quotes must be doubled inside quoted fields\n\
             - duplicate or empty header names\n\
             - mixed types in one column (numbers vs text, several date formats)\n\
             - leading/trailing whitespace in values, inconsistent delimiters",
        ),
        FileType::Xml => (
            "XML defect checklist",
            "- mismatched or unclosed tags, more than one root element\n\
             - unescaped `&` or `<` in text and attribute values\n\
             - duplicate attributes on one element\n\
             - inconsistent structure between sibling elements of the same name\n\
             - declared encoding that does not match the content",
        ),
        FileType::Yaml => (
            "YAML defect checklist",
            "- tabs used for indentation, inconsistent indentation depth\n\
             - duplicate keys in one mapping\n\
             - unquoted values that YAML coerces (yes/no/on/off, 010, 1e3, dates)\n\
             - a colon followed by text without a space, unclosed flow collections\n\
             - mixing a mapping and a list at the same indentation level",
        ),
    }
}

impl ReferenceProvider for StaticReferences {
    fn version(&self) -> &str {
        &self.version
    }

    fn snippets(&self, file_type: FileType, hints: &[ParserHint]) -> Vec<ReferenceSnippet> {
        let (title, text) = checklist(file_type);
        let mut out = vec![ReferenceSnippet {
            title: title.to_string(),
            text: text.to_string(),
        }];

        if hints.iter().any(|h| h.kind == HintKind::SyntaxError) {
            out.push(ReferenceSnippet {
                title: "Parser findings".to_string(),
                text: "A strict parser rejected this file. Its reported positions are exact; \
                       report each of those defects, then look for further problems the \
                       parser could not reach after its first failure."
                    .to_string(),
            });
        }
        out
    }
}
