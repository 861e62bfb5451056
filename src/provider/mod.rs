//! Persistence service contract
//!
//! The controller owns exactly one provider per instance and serializes access
//! to it, so implementations may assume no concurrent calls. Every failure is
//! reported as a [`ProviderError`]; a provider must never panic on bad input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;

pub mod memory;
pub mod toy;

pub use memory::MemoryProvider;

/// Persistence-layer failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No paper with this id
    #[error("Paper '{0}' not found")]
    PaperNotFound(String),

    /// No event with this id (in this paper)
    #[error("Event {0} not found")]
    EventNotFound(u64),

    /// No context with this id (in this paper)
    #[error("Context {0} not found")]
    ContextNotFound(u64),

    /// Unknown grounding id
    #[error("Grounding '{0}' not found")]
    GroundingNotFound(String),

    /// The annotation exists but has the wrong origin for this operation
    #[error("{kind} {id} is not a {expected} annotation")]
    WrongSource {
        /// "Event" or "Context"
        kind: &'static str,
        /// Annotation id
        id: u64,
        /// Origin the operation requires
        expected: AnnotationSource,
    },

    /// Interval end precedes its start
    #[error("Invalid interval {start}-{end}")]
    InvalidInterval {
        /// Interval start
        start: u32,
        /// Interval end
        end: u32,
    },

    /// Line number outside the paper
    #[error("Line {line} is outside paper '{paper}'")]
    LineOutOfRange {
        /// Paper id
        paper: String,
        /// Requested line
        line: u32,
    },

    /// Second annotation pass requested twice
    #[error(
        "The selected paper ({0}) already seems to have its second annotation pass activated. Please try refreshing the page."
    )]
    SecondPassActive(String),

    /// The provider does not implement this operation
    #[error("Operation '{0}' is not supported by this provider")]
    Unsupported(&'static str),

    /// The provider was shut down
    #[error("Persistence service is shut down")]
    Unavailable,
}

/// Convenience result alias for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Where an annotation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSource {
    /// Produced by the automatic reader
    Reach,
    /// Created by an annotator
    Manual,
    /// Imported from curated baseline data; not deletable
    Curated,
}

impl fmt::Display for AnnotationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnnotationSource::Reach => "reach",
            AnnotationSource::Manual => "manual",
            AnnotationSource::Curated => "curated",
        })
    }
}

/// A character interval on one line of a paper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Paper id
    pub paper_id: String,
    /// Zero-based sentence index
    pub line_num: u32,
    /// Interval start (inclusive)
    pub start: u32,
    /// Interval end (inclusive)
    pub end: u32,
}

impl Span {
    /// Whether two spans on the same line touch or overlap
    pub fn overlaps(&self, other: &Span) -> bool {
        self.paper_id == other.paper_id
            && self.line_num == other.line_num
            && self.start <= other.end
            && other.start <= self.end
    }
}

/// Paging and filtering for the paper selection table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaperListQuery {
    /// Client draw counter, echoed back
    pub draw: u64,
    /// Case-insensitive substring filter on id, title and timestamp
    pub search: Option<String>,
    /// Offset into the filtered list
    pub start: usize,
    /// Page length; `None` returns everything after `start`
    pub length: Option<usize>,
}

/// One row of the paper selection table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSummary {
    /// Paper id
    pub id: String,
    /// Title
    pub title: String,
    /// Last modification time, formatted for display
    pub last_modified: String,
    /// Whether the paper is locked against editing
    pub locked: bool,
    /// Annotation pass (1 or 2)
    pub annotation_pass: u8,
}

/// Paper selection table page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperList {
    /// Echo of the query's draw counter
    pub draw: u64,
    /// Papers before filtering
    pub records_total: usize,
    /// Papers after filtering
    pub records_filtered: usize,
    /// Requested page
    pub data: Vec<PaperSummary>,
}

/// Paper text and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperView {
    /// Paper id
    pub id: String,
    /// Title
    pub title: String,
    /// Comma-separated section start lines
    pub sections: String,
    /// Sentences, one per line
    pub sentences: Vec<String>,
    /// Whether the paper is locked against editing
    pub locked: bool,
    /// Annotation pass (1 or 2)
    pub annotation_pass: u8,
}

/// Everything the editor needs to display one paper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperData {
    /// Text and metadata
    pub paper: PaperView,
    /// Reader-produced and curated contexts
    pub contexts_reach: Vec<ContextRecord>,
    /// Annotator-created contexts
    pub contexts_manual: Vec<ContextRecord>,
    /// Display categories: description and grounding prefixes
    pub context_categories: Vec<(String, Vec<String>)>,
    /// Events ordered by line, then interval start
    pub events: Vec<EventRecord>,
}

/// An event mention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Server-assigned id
    pub id: u64,
    /// Paper id
    pub paper_id: String,
    /// Sentence index
    pub line_num: u32,
    /// Interval start
    pub interval_start: u32,
    /// Interval end
    pub interval_end: u32,
    /// Origin
    #[serde(rename = "type")]
    pub source: AnnotationSource,
    /// Flagged as a false positive (reach events, second pass)
    pub false_positive: bool,
    /// Associated grounding ids, sorted
    pub groundings: Vec<String>,
}

impl EventRecord {
    /// The event's interval as a span
    pub fn span(&self) -> Span {
        Span {
            paper_id: self.paper_id.clone(),
            line_num: self.line_num,
            start: self.interval_start,
            end: self.interval_end,
        }
    }
}

/// A context mention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Server-assigned id
    pub id: u64,
    /// Paper id
    pub paper_id: String,
    /// Sentence index
    pub line_num: u32,
    /// Interval start
    pub interval_start: u32,
    /// Interval end
    pub interval_end: u32,
    /// Origin
    #[serde(rename = "type")]
    pub source: AnnotationSource,
    /// Mention text
    pub free_text: String,
    /// Grounding the text maps to
    pub grounding_id: String,
}

/// A paper's annotator comments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comments {
    /// Free-form comment text
    pub comment: String,
}

/// Result of activating the second annotation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondPass {
    /// Paper id
    pub paper_id: String,
    /// Reach events that inherited groundings from overlapping manual events
    pub inherited: usize,
}

/// Result of loading the bundled sample paper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToyLoadReport {
    /// Paper id
    pub paper_id: String,
    /// Sentences loaded
    pub sentences: usize,
    /// Events loaded
    pub events: usize,
    /// Contexts loaded
    pub contexts: usize,
}

/// Persistence service used by command handlers.
///
/// Only [`name`](Provider::name) and [`shutdown`](Provider::shutdown) are
/// mandatory; other operations report [`ProviderError::Unsupported`] unless
/// overridden.
pub trait Provider: Send + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Release the underlying storage; later calls fail with `Unavailable`
    fn shutdown(&mut self) -> impl Future<Output = ProviderResult<()>> + Send;

    /// Paper selection table
    fn paper_list(
        &mut self,
        _query: PaperListQuery,
    ) -> impl Future<Output = ProviderResult<PaperList>> + Send {
        async { Err(ProviderError::Unsupported("paper_list")) }
    }

    /// Full view of one paper
    fn paper_data(
        &mut self,
        _paper_id: &str,
    ) -> impl Future<Output = ProviderResult<PaperData>> + Send {
        async { Err(ProviderError::Unsupported("paper_data")) }
    }

    /// Current comments of a paper (empty if none were saved)
    fn comments(&mut self, _paper_id: &str) -> impl Future<Output = ProviderResult<Comments>> + Send {
        async { Err(ProviderError::Unsupported("comments")) }
    }

    /// Replace the comments of a paper
    fn save_comments(
        &mut self,
        _paper_id: &str,
        _comments: String,
    ) -> impl Future<Output = ProviderResult<()>> + Send {
        async { Err(ProviderError::Unsupported("save_comments")) }
    }

    /// Create a manual event, or return the identical existing one
    fn create_event(&mut self, _span: Span) -> impl Future<Output = ProviderResult<EventRecord>> + Send {
        async { Err(ProviderError::Unsupported("create_event")) }
    }

    /// Delete a manual event
    fn delete_event(
        &mut self,
        _paper_id: &str,
        _event_id: u64,
    ) -> impl Future<Output = ProviderResult<()>> + Send {
        async { Err(ProviderError::Unsupported("delete_event")) }
    }

    /// Move an event's interval
    fn resize_event(
        &mut self,
        _event_id: u64,
        _start: u32,
        _end: u32,
    ) -> impl Future<Output = ProviderResult<()>> + Send {
        async { Err(ProviderError::Unsupported("resize_event")) }
    }

    /// Toggle the false-positive flag of a reach event; returns the new flag
    fn toggle_false_positive(
        &mut self,
        _paper_id: &str,
        _event_id: u64,
    ) -> impl Future<Output = ProviderResult<bool>> + Send {
        async { Err(ProviderError::Unsupported("toggle_false_positive")) }
    }

    /// Create a manual context, grounding its text
    fn create_context(
        &mut self,
        _span: Span,
        _free_text: String,
    ) -> impl Future<Output = ProviderResult<ContextRecord>> + Send {
        async { Err(ProviderError::Unsupported("create_context")) }
    }

    /// Delete a manual context
    fn delete_context(
        &mut self,
        _paper_id: &str,
        _context_id: u64,
    ) -> impl Future<Output = ProviderResult<()>> + Send {
        async { Err(ProviderError::Unsupported("delete_context")) }
    }

    /// Associate exactly the given groundings with an event
    fn save_event_contexts(
        &mut self,
        _event_id: u64,
        _groundings: Vec<String>,
    ) -> impl Future<Output = ProviderResult<()>> + Send {
        async { Err(ProviderError::Unsupported("save_event_contexts")) }
    }

    /// Activate the second annotation pass of a paper
    fn second_annotation_pass(
        &mut self,
        _paper_id: &str,
    ) -> impl Future<Output = ProviderResult<SecondPass>> + Send {
        async { Err(ProviderError::Unsupported("second_annotation_pass")) }
    }

    /// Load the bundled sample paper
    fn toy_load(&mut self) -> impl Future<Output = ProviderResult<ToyLoadReport>> + Send {
        async { Err(ProviderError::Unsupported("toy_load")) }
    }
}
