use std::sync::OnceLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Retrieval payload attached to an answer.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub chunks: Vec<ReferenceChunk>,
    #[serde(default)]
    pub doc_aggs: Vec<DocumentAggregate>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ReferenceChunk {
    #[serde(default, alias = "chunk_id")]
    pub id: String,
    #[serde(default, alias = "content_with_weight")]
    pub content: String,
    #[serde(default, alias = "doc_id")]
    pub document_id: String,
    #[serde(default, alias = "docnm_kwd")]
    pub document_name: String,
    #[serde(default, alias = "img_id")]
    pub image_id: Option<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DocumentAggregate {
    #[serde(default)]
    pub doc_id: String,
    #[serde(default)]
    pub doc_name: String,
    #[serde(default)]
    pub count: u64,
}

/// Outcome of resolving one `##N$$` citation marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Citation<'a> {
    Resolved {
        index: usize,
        chunk: &'a ReferenceChunk,
        document_name: &'a str,
    },
    /// Chunk or document metadata is missing; rendered as a neutral placeholder.
    Unavailable { index: usize },
}

impl Reference {
    /// Parses the raw reference object from a stream chunk.
    ///
    /// An unexpected shape degrades to `None` instead of failing the answer.
    pub fn from_value(value: Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        match serde_json::from_value::<Self>(value) {
            Ok(reference) => Some(reference),
            Err(error) => {
                tracing::debug!(error = %error, "ignoring reference payload with unexpected shape");
                None
            }
        }
    }

    pub fn resolve(&self, index: usize) -> Citation<'_> {
        let Some(chunk) = self.chunks.get(index) else {
            return Citation::Unavailable { index };
        };
        if chunk.document_id.is_empty() {
            return Citation::Unavailable { index };
        }

        let document_name = if chunk.document_name.is_empty() {
            self.doc_aggs
                .iter()
                .find(|document| document.doc_id == chunk.document_id)
                .map(|document| document.doc_name.as_str())
        } else {
            Some(chunk.document_name.as_str())
        };

        match document_name {
            Some(document_name) => Citation::Resolved {
                index,
                chunk,
                document_name,
            },
            None => Citation::Unavailable { index },
        }
    }

    /// Resolves every citation marker in `text`, in order of appearance.
    pub fn citations_in(&self, text: &str) -> Vec<Citation<'_>> {
        citation_indices(text)
            .into_iter()
            .map(|index| self.resolve(index))
            .collect()
    }
}

fn citation_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"##(\d+)\$\$").unwrap_or_else(|err| panic!("valid citation regex: {err}"))
    })
}

/// Extracts the numeric indices of `##N$$` markers.
pub fn citation_indices(text: &str) -> Vec<usize> {
    citation_marker()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1)?.as_str().parse().ok())
        .collect()
}
