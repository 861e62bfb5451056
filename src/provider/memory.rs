//! In-memory persistence service
//!
//! Holds papers, annotations and the grounding dictionary in ordered maps.
//! Ids come from a single counter shared by events and contexts, so an id is
//! never handed out twice within one provider.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use super::{
    AnnotationSource, Comments, ContextRecord, EventRecord, PaperData, PaperList, PaperListQuery,
    PaperSummary, PaperView, Provider, ProviderError, ProviderResult, SecondPass, Span,
    ToyLoadReport, toy,
};

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S UTC";

/// Display categories for context groundings: description and id prefixes
pub const CONTEXT_CATEGORIES: &[(&str, &[&str])] = &[
    ("Species", &["taxonomy"]),
    ("Organ", &["uaz:UBERON"]),
    ("Tissue", &["tissuelist"]),
    ("Cell Type", &["uaz:CL"]),
    ("Cellular Component", &["go"]),
    ("Cell Line", &["atcc", "cellosaurus"]),
];

#[derive(Debug, Clone)]
struct Paper {
    title: String,
    sections: String,
    sentences: Vec<String>,
    locked: bool,
    annotation_pass: u8,
    last_modified: DateTime<Utc>,
    comment: Option<String>,
}

#[derive(Debug, Clone)]
struct Event {
    span: Span,
    source: AnnotationSource,
    false_positive: bool,
    groundings: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Context {
    span: Span,
    source: AnnotationSource,
    free_text: String,
    grounding_id: String,
}

/// Provider keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryProvider {
    papers: BTreeMap<String, Paper>,
    events: BTreeMap<u64, Event>,
    contexts: BTreeMap<u64, Context>,
    groundings: BTreeSet<String>,
    grounding_texts: HashMap<String, String>,
    next_id: u64,
    closed: bool,
}

impl MemoryProvider {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with the bundled sample paper
    pub fn with_toy_data() -> Self {
        let mut provider = Self::new();
        provider.load_toy_paper();
        provider
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of stored papers
    pub fn paper_count(&self) -> usize {
        self.papers.len()
    }

    /// Whether no papers are stored
    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }

    /// Add (or replace) a paper; its annotations are removed
    pub fn add_paper(&mut self, id: &str, title: &str, sections: &str, sentences: Vec<String>) {
        self.remove_paper(id);
        self.papers.insert(
            id.to_string(),
            Paper {
                title: title.to_string(),
                sections: sections.to_string(),
                sentences,
                locked: false,
                annotation_pass: 1,
                last_modified: Utc::now(),
                comment: None,
            },
        );
    }

    /// Remove a paper and its annotations; returns whether it existed
    pub fn remove_paper(&mut self, id: &str) -> bool {
        self.events.retain(|_, e| e.span.paper_id != id);
        self.contexts.retain(|_, c| c.span.paper_id != id);
        self.papers.remove(id).is_some()
    }

    /// Lock or unlock a paper against editing in the client
    pub fn set_locked(&mut self, paper_id: &str, locked: bool) -> ProviderResult<()> {
        self.paper_mut(paper_id)?.locked = locked;
        Ok(())
    }

    /// Register a grounding id and, optionally, a text that maps to it
    pub fn add_grounding(&mut self, grounding_id: &str, free_text: Option<&str>) {
        self.groundings.insert(grounding_id.to_string());
        if let Some(text) = free_text {
            self.grounding_texts
                .insert(text.to_string(), grounding_id.to_string());
        }
    }

    /// Insert an event of any origin, or return the identical existing one
    pub fn add_event(
        &mut self,
        span: Span,
        source: AnnotationSource,
        groundings: &[&str],
    ) -> ProviderResult<EventRecord> {
        self.check_span(&span)?;
        let id = match self.find_event(&span, source) {
            Some(id) => {
                debug!(
                    paper = %span.paper_id,
                    line = span.line_num,
                    start = span.start,
                    end = span.end,
                    "event already exists"
                );
                id
            }
            None => {
                let id = self.allocate_id();
                self.events.insert(
                    id,
                    Event {
                        span: span.clone(),
                        source,
                        false_positive: false,
                        groundings: BTreeSet::new(),
                    },
                );
                id
            }
        };

        for grounding in groundings {
            self.groundings.insert(grounding.to_string());
            if let Some(event) = self.events.get_mut(&id) {
                event.groundings.insert(grounding.to_string());
            }
        }
        self.touch(&span.paper_id);
        self.event_record(id)
    }

    /// Insert a context of any origin, or return the identical existing one.
    ///
    /// Without an explicit grounding the text is looked up in the grounding
    /// dictionary, and a `manual:` grounding is generated when it is unknown.
    pub fn add_context(
        &mut self,
        span: Span,
        free_text: &str,
        source: AnnotationSource,
        grounding_id: Option<&str>,
    ) -> ProviderResult<ContextRecord> {
        self.check_span(&span)?;
        let grounding_id = match grounding_id {
            Some(id) => {
                self.add_grounding(id, Some(free_text));
                id.to_string()
            }
            None => self.ground_text(free_text),
        };

        let existing = self.contexts.iter().find_map(|(id, c)| {
            (c.span == span && c.source == source && c.grounding_id == grounding_id).then_some(*id)
        });
        let id = match existing {
            Some(id) => {
                debug!(
                    paper = %span.paper_id,
                    line = span.line_num,
                    start = span.start,
                    end = span.end,
                    "context already exists"
                );
                id
            }
            None => {
                let id = self.allocate_id();
                self.contexts.insert(
                    id,
                    Context {
                        span: span.clone(),
                        source,
                        free_text: free_text.to_string(),
                        grounding_id,
                    },
                );
                id
            }
        };
        self.touch(&span.paper_id);
        self.context_record(id)
    }

    fn load_toy_paper(&mut self) -> ToyLoadReport {
        let sentences = toy::SENTENCES.iter().map(|s| s.to_string()).collect();
        self.add_paper(toy::PAPER_ID, toy::TITLE, toy::SECTIONS, sentences);

        let span = |line, start, end| Span {
            paper_id: toy::PAPER_ID.to_string(),
            line_num: line,
            start,
            end,
        };

        let mut contexts = 0;
        for context in toy::CONTEXTS {
            let loaded = self.add_context(
                span(context.line, context.start, context.end),
                context.text,
                context.source,
                Some(context.grounding),
            );
            if loaded.is_ok() {
                contexts += 1;
            }
        }

        let mut events = 0;
        for event in toy::EVENTS {
            let loaded = self.add_event(
                span(event.line, event.start, event.end),
                event.source,
                event.groundings,
            );
            if loaded.is_ok() {
                events += 1;
            }
        }

        info!(paper = toy::PAPER_ID, events, contexts, "sample paper loaded");
        ToyLoadReport {
            paper_id: toy::PAPER_ID.to_string(),
            sentences: toy::SENTENCES.len(),
            events,
            contexts,
        }
    }

    fn ensure_open(&self) -> ProviderResult<()> {
        if self.closed {
            Err(ProviderError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn paper(&self, paper_id: &str) -> ProviderResult<&Paper> {
        self.papers
            .get(paper_id)
            .ok_or_else(|| ProviderError::PaperNotFound(paper_id.to_string()))
    }

    fn paper_mut(&mut self, paper_id: &str) -> ProviderResult<&mut Paper> {
        self.papers
            .get_mut(paper_id)
            .ok_or_else(|| ProviderError::PaperNotFound(paper_id.to_string()))
    }

    fn touch(&mut self, paper_id: &str) {
        if let Some(paper) = self.papers.get_mut(paper_id) {
            paper.last_modified = Utc::now();
        }
    }

    fn check_interval(start: u32, end: u32) -> ProviderResult<()> {
        if start > end {
            Err(ProviderError::InvalidInterval { start, end })
        } else {
            Ok(())
        }
    }

    fn check_span(&self, span: &Span) -> ProviderResult<()> {
        let paper = self.paper(&span.paper_id)?;
        if span.line_num as usize >= paper.sentences.len() {
            return Err(ProviderError::LineOutOfRange {
                paper: span.paper_id.clone(),
                line: span.line_num,
            });
        }
        Self::check_interval(span.start, span.end)
    }

    fn find_event(&self, span: &Span, source: AnnotationSource) -> Option<u64> {
        self.events
            .iter()
            .find_map(|(id, e)| (e.span == *span && e.source == source).then_some(*id))
    }

    fn ground_text(&mut self, free_text: &str) -> String {
        if let Some(id) = self.grounding_texts.get(free_text) {
            return id.clone();
        }
        let id = format!("manual:{}", free_text.replace(' ', "-"));
        debug!(grounding = %id, text = free_text, "generated manual grounding");
        self.add_grounding(&id, Some(free_text));
        id
    }

    fn event_record(&self, id: u64) -> ProviderResult<EventRecord> {
        let event = self.events.get(&id).ok_or(ProviderError::EventNotFound(id))?;
        Ok(EventRecord {
            id,
            paper_id: event.span.paper_id.clone(),
            line_num: event.span.line_num,
            interval_start: event.span.start,
            interval_end: event.span.end,
            source: event.source,
            false_positive: event.false_positive,
            groundings: event.groundings.iter().cloned().collect(),
        })
    }

    fn context_record(&self, id: u64) -> ProviderResult<ContextRecord> {
        let context = self
            .contexts
            .get(&id)
            .ok_or(ProviderError::ContextNotFound(id))?;
        Ok(ContextRecord {
            id,
            paper_id: context.span.paper_id.clone(),
            line_num: context.span.line_num,
            interval_start: context.span.start,
            interval_end: context.span.end,
            source: context.source,
            free_text: context.free_text.clone(),
            grounding_id: context.grounding_id.clone(),
        })
    }

    fn event_in_paper(&self, paper_id: &str, event_id: u64) -> ProviderResult<&Event> {
        self.events
            .get(&event_id)
            .filter(|e| e.span.paper_id == paper_id)
            .ok_or(ProviderError::EventNotFound(event_id))
    }

    fn summary(id: &str, paper: &Paper) -> PaperSummary {
        PaperSummary {
            id: id.to_string(),
            title: paper.title.clone(),
            last_modified: paper.last_modified.format(TIMESTAMP_FORMAT).to_string(),
            locked: paper.locked,
            annotation_pass: paper.annotation_pass,
        }
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn shutdown(&mut self) -> ProviderResult<()> {
        self.closed = true;
        debug!(papers = self.papers.len(), "memory provider shut down");
        Ok(())
    }

    async fn paper_list(&mut self, query: PaperListQuery) -> ProviderResult<PaperList> {
        self.ensure_open()?;
        let needle = query.search.as_deref().map(str::to_lowercase);
        let filtered: Vec<PaperSummary> = self
            .papers
            .iter()
            .map(|(id, paper)| Self::summary(id, paper))
            .filter(|row| match &needle {
                None => true,
                Some(needle) => [&row.id, &row.title, &row.last_modified]
                    .iter()
                    .any(|field| field.to_lowercase().contains(needle.as_str())),
            })
            .collect();

        let records_filtered = filtered.len();
        let page = filtered
            .into_iter()
            .skip(query.start)
            .take(query.length.unwrap_or(usize::MAX))
            .collect();

        Ok(PaperList {
            draw: query.draw,
            records_total: self.papers.len(),
            records_filtered,
            data: page,
        })
    }

    async fn paper_data(&mut self, paper_id: &str) -> ProviderResult<PaperData> {
        self.ensure_open()?;
        let paper = self.paper(paper_id)?;

        let mut contexts_reach = Vec::new();
        let mut contexts_manual = Vec::new();
        for (id, context) in &self.contexts {
            if context.span.paper_id != paper_id {
                continue;
            }
            let record = self.context_record(*id)?;
            match context.source {
                AnnotationSource::Manual => contexts_manual.push(record),
                AnnotationSource::Reach | AnnotationSource::Curated => contexts_reach.push(record),
            }
        }

        let mut events = self
            .events
            .iter()
            .filter(|(_, e)| e.span.paper_id == paper_id)
            .map(|(id, _)| self.event_record(*id))
            .collect::<ProviderResult<Vec<_>>>()?;
        events.sort_by_key(|e| (e.line_num, e.interval_start, e.id));

        Ok(PaperData {
            paper: PaperView {
                id: paper_id.to_string(),
                title: paper.title.clone(),
                sections: paper.sections.clone(),
                sentences: paper.sentences.clone(),
                locked: paper.locked,
                annotation_pass: paper.annotation_pass,
            },
            contexts_reach,
            contexts_manual,
            context_categories: CONTEXT_CATEGORIES
                .iter()
                .map(|(name, prefixes)| {
                    (
                        name.to_string(),
                        prefixes.iter().map(|p| p.to_string()).collect(),
                    )
                })
                .collect(),
            events,
        })
    }

    async fn comments(&mut self, paper_id: &str) -> ProviderResult<Comments> {
        self.ensure_open()?;
        let paper = self.paper_mut(paper_id)?;
        let comment = paper.comment.get_or_insert_with(String::new).clone();
        Ok(Comments { comment })
    }

    async fn save_comments(&mut self, paper_id: &str, comments: String) -> ProviderResult<()> {
        self.ensure_open()?;
        self.paper_mut(paper_id)?.comment = Some(comments);
        self.touch(paper_id);
        Ok(())
    }

    async fn create_event(&mut self, span: Span) -> ProviderResult<EventRecord> {
        self.ensure_open()?;
        self.add_event(span, AnnotationSource::Manual, &[])
    }

    async fn delete_event(&mut self, paper_id: &str, event_id: u64) -> ProviderResult<()> {
        self.ensure_open()?;
        let event = self.event_in_paper(paper_id, event_id)?;
        if event.source != AnnotationSource::Manual {
            return Err(ProviderError::WrongSource {
                kind: "Event",
                id: event_id,
                expected: AnnotationSource::Manual,
            });
        }
        self.events.remove(&event_id);
        self.touch(paper_id);
        Ok(())
    }

    async fn resize_event(&mut self, event_id: u64, start: u32, end: u32) -> ProviderResult<()> {
        self.ensure_open()?;
        Self::check_interval(start, end)?;
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or(ProviderError::EventNotFound(event_id))?;
        event.span.start = start;
        event.span.end = end;
        let paper_id = event.span.paper_id.clone();
        self.touch(&paper_id);
        Ok(())
    }

    async fn toggle_false_positive(&mut self, paper_id: &str, event_id: u64) -> ProviderResult<bool> {
        self.ensure_open()?;
        let source = self.event_in_paper(paper_id, event_id)?.source;
        if source != AnnotationSource::Reach {
            return Err(ProviderError::WrongSource {
                kind: "Event",
                id: event_id,
                expected: AnnotationSource::Reach,
            });
        }
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or(ProviderError::EventNotFound(event_id))?;
        event.false_positive = !event.false_positive;
        let flag = event.false_positive;
        self.touch(paper_id);
        Ok(flag)
    }

    async fn create_context(&mut self, span: Span, free_text: String) -> ProviderResult<ContextRecord> {
        self.ensure_open()?;
        self.add_context(span, &free_text, AnnotationSource::Manual, None)
    }

    async fn delete_context(&mut self, paper_id: &str, context_id: u64) -> ProviderResult<()> {
        self.ensure_open()?;
        let context = self
            .contexts
            .get(&context_id)
            .filter(|c| c.span.paper_id == paper_id)
            .ok_or(ProviderError::ContextNotFound(context_id))?;
        if context.source != AnnotationSource::Manual {
            return Err(ProviderError::WrongSource {
                kind: "Context",
                id: context_id,
                expected: AnnotationSource::Manual,
            });
        }
        self.contexts.remove(&context_id);
        self.touch(paper_id);
        Ok(())
    }

    async fn save_event_contexts(&mut self, event_id: u64, groundings: Vec<String>) -> ProviderResult<()> {
        self.ensure_open()?;
        if let Some(unknown) = groundings.iter().find(|g| !self.groundings.contains(*g)) {
            return Err(ProviderError::GroundingNotFound(unknown.clone()));
        }
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or(ProviderError::EventNotFound(event_id))?;
        event.groundings = groundings.into_iter().collect();
        let paper_id = event.span.paper_id.clone();
        self.touch(&paper_id);
        Ok(())
    }

    async fn second_annotation_pass(&mut self, paper_id: &str) -> ProviderResult<SecondPass> {
        self.ensure_open()?;
        let paper = self.paper_mut(paper_id)?;
        if paper.annotation_pass != 1 {
            return Err(ProviderError::SecondPassActive(paper_id.to_string()));
        }
        paper.annotation_pass = 2;

        let manual: Vec<(Span, BTreeSet<String>)> = self
            .events
            .values()
            .filter(|e| e.span.paper_id == paper_id && e.source == AnnotationSource::Manual)
            .map(|e| (e.span.clone(), e.groundings.clone()))
            .collect();

        let mut inherited = 0;
        for event in self.events.values_mut() {
            if event.span.paper_id != paper_id || event.source != AnnotationSource::Reach {
                continue;
            }
            let mut overlapped = false;
            for (span, groundings) in &manual {
                if event.span.overlaps(span) {
                    overlapped = true;
                    event.groundings.extend(groundings.iter().cloned());
                }
            }
            if overlapped {
                inherited += 1;
            }
        }

        self.touch(paper_id);
        info!(paper = paper_id, inherited, "second annotation pass activated");
        Ok(SecondPass {
            paper_id: paper_id.to_string(),
            inherited,
        })
    }

    async fn toy_load(&mut self) -> ProviderResult<ToyLoadReport> {
        self.ensure_open()?;
        Ok(self.load_toy_paper())
    }
}
