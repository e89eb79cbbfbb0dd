//! Deterministic prompt assembly.
//!
//! Layout (template version 1):
//!
//! ```text
//! [context:<doc_id>]      one block per kept chunk, best score first
//! <chunk text>
//!
//! [question]              always last, never truncated
//! <query text>
//! ```
//!
//! Size is measured in `char`s of the rendered prompt. The query is counted
//! against the budget first; chunks are then added in score order until the
//! next one would not fit.

use serde::Serialize;

use crate::retrieval::RetrievedChunk;

/// Bumped whenever segment order or rendering changes.
pub const TEMPLATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Context,
    Question,
}

/// One rendered block of the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub role: Role,
    /// Source document for context segments.
    pub doc_id: Option<String>,
    pub text: String,
}

impl Segment {
    fn context(doc_id: &str, text: &str) -> Self {
        Self {
            role: Role::Context,
            doc_id: Some(doc_id.to_string()),
            text: text.to_string(),
        }
    }

    fn question(text: &str) -> Self {
        Self {
            role: Role::Question,
            doc_id: None,
            text: text.to_string(),
        }
    }

    pub fn render(&self) -> String {
        match self.role {
            Role::Context => format!(
                "[context:{}]\n{}\n\n",
                self.doc_id.as_deref().unwrap_or_default(),
                self.text
            ),
            Role::Question => format!("[question]\n{}\n", self.text),
        }
    }

    pub fn size(&self) -> usize {
        self.render().chars().count()
    }
}

/// Prompt ready for dispatch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledPrompt {
    segments: Vec<Segment>,
    template_version: u32,
}

impl AssembledPrompt {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn template_version(&self) -> u32 {
        self.template_version
    }

    /// Ids of the documents included as context, in prompt order.
    pub fn context_ids(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| segment.doc_id.as_deref())
            .collect()
    }

    pub fn render(&self) -> String {
        self.segments.iter().map(Segment::render).collect()
    }

    /// Rendered size in chars.
    pub fn size(&self) -> usize {
        self.segments.iter().map(Segment::size).sum()
    }
}

/// Merge `chunks` and the query into a prompt of at most `budget` chars.
///
/// The only prompt that may exceed `budget` is one whose question segment
/// alone already does; it then carries no context.
pub fn assemble(query: &str, chunks: &[RetrievedChunk], budget: usize) -> AssembledPrompt {
    let question = Segment::question(query);
    let mut used = question.size();

    let mut ranked: Vec<&RetrievedChunk> = chunks.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut segments = Vec::with_capacity(ranked.len() + 1);
    for chunk in ranked {
        let segment = Segment::context(&chunk.doc_id, &chunk.text);
        let size = segment.size();
        if used + size > budget {
            break;
        }
        used += size;
        segments.push(segment);
    }
    segments.push(question);

    AssembledPrompt {
        segments,
        template_version: TEMPLATE_VERSION,
    }
}
