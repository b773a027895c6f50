use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::PageState;
use crate::error::AgentError;

/// Size-bounded, ordered slice of page content handed to prompts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundedContext {
    pub chunks: Vec<String>,
    pub budget: usize,
}

impl BoundedContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn char_len(&self) -> usize {
        self.chunks.iter().map(|c| c.chars().count()).sum()
    }

    pub fn render(&self) -> String {
        self.chunks.join("\n---\n")
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, page: &PageState) -> Result<BoundedContext, AgentError>;
}

/// One narrowing / re-ranking pass over page chunks.
pub trait RetrievalStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, query: &str, chunks: Vec<String>) -> Vec<String>;
}

// ========================= Stages =========================

/// Splits cleaned markup into tag-aligned chunks of at most `chunk_chars`.
pub struct ChunkRetriever {
    pub chunk_chars: usize,
}

impl ChunkRetriever {
    pub fn split(&self, html: &str) -> Vec<String> {
        let cleaned = clean_html(html);
        let mut chunks = Vec::new();
        let mut current = String::new();
        for piece in cleaned.split_inclusive('>') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if !current.is_empty() && current.len() + piece.len() > self.chunk_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(piece);
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

impl Default for ChunkRetriever {
    fn default() -> Self {
        Self { chunk_chars: 800 }
    }
}

static NOISE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<!--.*?-->").expect("markup noise regex")
});
static INTERACTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<(a|button|input|select|textarea|option|label)\b|xpath="|role="(button|link|textbox)"|onclick="#)
        .expect("interactive element regex")
});

fn clean_html(html: &str) -> String {
    NOISE_RE.replace_all(html, "").into_owned()
}

/// Keeps chunks that contain an element the agent can act on.
#[derive(Default)]
pub struct InteractiveRetriever;

impl InteractiveRetriever {
    pub fn new() -> Self {
        Self
    }
}

impl RetrievalStage for InteractiveRetriever {
    fn name(&self) -> &'static str {
        "interactive"
    }

    fn apply(&self, _query: &str, chunks: Vec<String>) -> Vec<String> {
        chunks.into_iter().filter(|c| INTERACTIVE_RE.is_match(c)).collect()
    }
}

/// Ranks chunks by how many query terms they mention and keeps the best `top_k`.
pub struct KeywordRetriever {
    pub top_k: usize,
}

impl Default for KeywordRetriever {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

fn terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

impl RetrievalStage for KeywordRetriever {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn apply(&self, query: &str, chunks: Vec<String>) -> Vec<String> {
        let terms = terms(query);
        let mut scored: Vec<(usize, usize, String)> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let lower = c.to_lowercase();
                let score = terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
                (score, i, c)
            })
            .filter(|(score, _, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(self.top_k).map(|(_, _, c)| c).collect()
    }
}

// ========================= Pipeline =========================

/// Chunker followed by narrowing stages. A stage that returns nothing leaves
/// the previous result in place; the final result is cut to `budget` chars.
pub struct RetrieverPipeline {
    chunker: ChunkRetriever,
    stages: Vec<Box<dyn RetrievalStage>>,
    budget: usize,
}

impl RetrieverPipeline {
    pub fn new(chunker: ChunkRetriever, budget: usize) -> Self {
        Self { chunker, stages: Vec::new(), budget }
    }

    pub fn stage(mut self, stage: impl RetrievalStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    fn bound(&self, chunks: Vec<String>) -> Vec<String> {
        let mut out = Vec::new();
        let mut used = 0usize;
        for chunk in chunks {
            let n = chunk.chars().count();
            if used + n <= self.budget {
                used += n;
                out.push(chunk);
                continue;
            }
            let room = self.budget.saturating_sub(used);
            if room > 0 {
                out.push(chunk.chars().take(room).collect());
            }
            break;
        }
        out
    }
}

impl Default for RetrieverPipeline {
    fn default() -> Self {
        Self::new(ChunkRetriever::default(), 4000)
            .stage(InteractiveRetriever::new())
            .stage(KeywordRetriever::default())
    }
}

#[async_trait]
impl Retriever for RetrieverPipeline {
    async fn retrieve(&self, query: &str, page: &PageState) -> Result<BoundedContext, AgentError> {
        let mut chunks = self.chunker.split(&page.html);
        for stage in &self.stages {
            let narrowed = stage.apply(query, chunks.clone());
            debug!(stage = stage.name(), before = chunks.len(), after = narrowed.len(), "retrieval stage");
            if !narrowed.is_empty() {
                chunks = narrowed;
            }
        }
        Ok(BoundedContext { chunks: self.bound(chunks), budget: self.budget })
    }
}
