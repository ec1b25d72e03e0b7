//! Token-budgeted chunk / call / merge / retry engine.
//!
//! Every model-backed stage runs through [`map_refine`]. The engine:
//!
//! 1. Splits the input into chunks that fit the model's context window
//!    after reserving prompt overhead, the response allowance and the
//!    system prompt.
//! 2. For each chunk, in order, asks the task to build a prompt from the
//!    chunk, the results accumulated so far and any feedback from a failed
//!    attempt.
//! 3. Parses the response with the task's parser and merges the items into
//!    the running result list under the task's dedupe key.
//! 4. Retries failed attempts while the task supplies feedback, and
//!    abandons the chunk otherwise.
//!
//! Prompts that still overflow the window first lose the oldest previous
//! results, then have their chunk split in half. Nothing here returns an
//! error: problems are collected in [`MapRefineOutcome::errors`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk::{chunk_lines, chunk_text, estimate_tokens, Chunk};
use crate::error::{GraphError, ParseError};
use crate::traits::llm::{ChatRequest, LanguageModel};
use crate::utils::text::truncate_with_ellipsis;

/// Longest error-context string fed back into a retry prompt.
const MAX_ERROR_CONTEXT_CHARS: usize = 600;

/// Budget and retry settings for one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRefineOptions {
    /// Model context window, in tokens
    pub max_model_tokens: usize,

    /// Tokens reserved for each response
    pub max_response_tokens: usize,

    /// Fraction of the window reserved for prompt scaffolding
    pub overhead_ratio: f32,

    /// Overlap between consecutive chunks, in tokens
    pub chunk_overlap_tokens: usize,

    /// Chunks are never split below this size
    pub min_chunk_tokens: usize,

    /// Attempts per chunk, including the first
    pub max_retries: usize,

    pub temperature: f32,
}

impl Default for MapRefineOptions {
    fn default() -> Self {
        Self {
            max_model_tokens: 8192,
            max_response_tokens: 2048,
            overhead_ratio: 0.25,
            chunk_overlap_tokens: 64,
            min_chunk_tokens: 256,
            max_retries: 3,
            temperature: 0.0,
        }
    }
}

impl MapRefineOptions {
    /// Window left after the overhead reservation.
    pub fn usable_tokens(&self) -> usize {
        let reserved = (self.max_model_tokens as f64 * self.overhead_ratio as f64).ceil() as usize;
        self.max_model_tokens.saturating_sub(reserved)
    }

    /// Largest chunk that fits alongside a system prompt of the given size.
    pub fn chunk_budget(&self, system_prompt_tokens: usize) -> usize {
        self.usable_tokens()
            .saturating_sub(self.max_response_tokens)
            .saturating_sub(system_prompt_tokens)
    }

    /// Largest system prompt that still leaves room for a minimum-size chunk.
    pub fn system_prompt_budget(&self) -> usize {
        self.chunk_budget(0).saturating_sub(self.min_chunk_tokens)
    }
}

/// Group listing lines (candidates, entities) into batches small enough to
/// ride in a system prompt after `base`.
///
/// Each batch keeps `base` plus its lines within
/// [`MapRefineOptions::system_prompt_budget`]. A line too long for any batch
/// still gets a batch of its own. No lines means no batches.
pub fn listing_batches(base: &str, lines: &[String], options: &MapRefineOptions) -> Vec<Range<usize>> {
    let budget = options
        .system_prompt_budget()
        .saturating_sub(estimate_tokens(base));

    let mut batches = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, line) in lines.iter().enumerate() {
        // +1 for the newline each line is joined with
        let cost = estimate_tokens(line) + 1;
        if i > start && used + cost > budget {
            batches.push(start..i);
            start = i;
            used = 0;
        }
        used += cost;
    }
    if start < lines.len() {
        batches.push(start..lines.len());
    }
    batches
}

/// A model-backed stage plugged into the engine.
pub trait RefineTask: Send + Sync {
    type Item: Send + Sync;

    /// Stage name used in logs and error entries.
    fn name(&self) -> &str;

    fn system_prompt(&self) -> String;

    /// Build the user prompt for one attempt.
    ///
    /// `previous` holds results accumulated from earlier chunks, oldest
    /// first (possibly trimmed to fit the window). `error_context` is the
    /// feedback from the failed previous attempt on this chunk.
    fn user_prompt(
        &self,
        chunk: &Chunk,
        previous: &[&Self::Item],
        error_context: Option<&str>,
    ) -> String;

    /// Turn a raw response into items.
    fn parse(&self, response: &str, chunk: &Chunk) -> Result<Vec<Self::Item>, ParseError>;

    /// Key under which items are deduplicated. `None` means always append.
    fn dedupe_key(&self, _item: &Self::Item) -> Option<String> {
        None
    }

    /// Fold a duplicate into the item already held. Keeps the first by default.
    fn merge(&self, _existing: &mut Self::Item, _incoming: Self::Item) {}

    /// Decide whether to retry after a failed attempt.
    ///
    /// Returning feedback retries the chunk with that text in the prompt;
    /// returning `None` abandons the chunk.
    fn on_error(&self, error: &GraphError, _attempt: usize, _chunk: &Chunk) -> Option<String> {
        Some(format!(
            "Your previous answer could not be used ({}). Reply with only a JSON array in the requested format.",
            error
        ))
    }

    /// Line-oriented inputs are chunked on record boundaries without overlap.
    fn line_oriented(&self) -> bool {
        false
    }
}

/// Result of one engine run.
#[derive(Debug, Clone)]
pub struct MapRefineOutcome<T> {
    /// Merged items in first-seen order
    pub items: Vec<T>,
    pub errors: Vec<String>,
    pub abandoned_chunks: usize,
    pub cancelled: bool,
    /// Model calls made, including retries
    pub calls: usize,
    /// Chunks processed to completion
    pub chunks_completed: usize,
}

impl<T> Default for MapRefineOutcome<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            errors: Vec::new(),
            abandoned_chunks: 0,
            cancelled: false,
            calls: 0,
            chunks_completed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MergeKey {
    Keyed(String),
    Seq(usize),
}

/// Run `task` over `content`.
pub async fn map_refine<T, L>(
    llm: &L,
    task: &T,
    content: &str,
    options: &MapRefineOptions,
    cancel: Option<&CancellationToken>,
) -> MapRefineOutcome<T::Item>
where
    T: RefineTask,
    L: LanguageModel + ?Sized,
{
    let mut outcome = MapRefineOutcome::default();

    if content.trim().is_empty() {
        return outcome;
    }

    if !llm.is_ready() {
        outcome
            .errors
            .push(format!("{}: language model is not ready", task.name()));
        return outcome;
    }

    let system = task.system_prompt();
    let system_tokens = estimate_tokens(&system);
    let chunk_budget = options.chunk_budget(system_tokens);
    if chunk_budget == 0 {
        let err = GraphError::Budget {
            needed: system_tokens + options.max_response_tokens,
            budget: options.usable_tokens(),
        };
        warn!(stage = task.name(), error = %err, "System prompt leaves no room for content");
        outcome.errors.push(format!("{}: {}", task.name(), err));
        return outcome;
    }

    let initial = if task.line_oriented() {
        chunk_lines(content, chunk_budget)
    } else {
        chunk_text(content, chunk_budget, options.chunk_overlap_tokens)
    };
    debug!(
        stage = task.name(),
        chunks = initial.len(),
        chunk_budget,
        "Starting map-refine"
    );

    let mut queue: VecDeque<Chunk> = initial.into();
    let mut results: IndexMap<MergeKey, T::Item> = IndexMap::new();
    let mut seq = 0usize;
    let mut chunk_index = 0usize;
    let max_attempts = options.max_retries.max(1);

    'chunks: while let Some(chunk) = queue.pop_front() {
        chunk_index += 1;
        let mut error_context: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let Some(user) = fit_prompt(task, &chunk, &results, error_context.as_deref(), system_tokens, options)
            else {
                // Too large even without previous results
                let chunk_tokens = chunk.estimated_tokens();
                if chunk_tokens / 2 < options.min_chunk_tokens {
                    let err = GraphError::Budget {
                        needed: chunk_tokens,
                        budget: chunk_budget,
                    };
                    warn!(
                        stage = task.name(),
                        chunk = chunk_index,
                        chunk_tokens,
                        "Chunk cannot be reduced further, abandoning"
                    );
                    outcome.errors.push(format!("{}: chunk {} abandoned: {}", task.name(), chunk_index, err));
                    outcome.abandoned_chunks += 1;
                    continue 'chunks;
                }

                let pieces = split_chunk(&chunk, task.line_oriented());
                debug!(
                    stage = task.name(),
                    chunk = chunk_index,
                    pieces = pieces.len(),
                    "Prompt over budget, splitting chunk"
                );
                for piece in pieces.into_iter().rev() {
                    queue.push_front(piece);
                }
                continue 'chunks;
            };

            if cancel.is_some_and(|c| c.is_cancelled()) {
                info!(stage = task.name(), chunk = chunk_index, "Cancelled before model call");
                outcome.cancelled = true;
                break 'chunks;
            }

            let request = ChatRequest::new(system.clone(), user)
                .with_max_tokens(options.max_response_tokens)
                .with_temperature(options.temperature);

            outcome.calls += 1;
            let attempt_result = match llm.chat_completions(request).await {
                Ok(response) => response
                    .into_content()
                    .and_then(|content| task.parse(&content, &chunk).map_err(GraphError::from)),
                Err(e) => Err(e),
            };

            match attempt_result {
                Ok(items) => {
                    let parsed = items.len();
                    for item in items {
                        let key = match task.dedupe_key(&item) {
                            Some(key) => MergeKey::Keyed(key),
                            None => {
                                seq += 1;
                                MergeKey::Seq(seq)
                            }
                        };
                        match results.get_mut(&key) {
                            Some(existing) => task.merge(existing, item),
                            None => {
                                results.insert(key, item);
                            }
                        }
                    }
                    debug!(
                        stage = task.name(),
                        chunk = chunk_index,
                        attempt,
                        parsed,
                        total = results.len(),
                        "Chunk merged"
                    );
                    outcome.chunks_completed += 1;
                    continue 'chunks;
                }
                Err(e) => {
                    warn!(
                        stage = task.name(),
                        chunk = chunk_index,
                        attempt,
                        error = %e,
                        "Chunk attempt failed"
                    );

                    let feedback = task.on_error(&e, attempt, &chunk);
                    match feedback {
                        Some(feedback) if attempt < max_attempts => {
                            error_context = Some(truncate_with_ellipsis(&feedback, MAX_ERROR_CONTEXT_CHARS));
                        }
                        _ => {
                            outcome.errors.push(format!(
                                "{}: chunk {} abandoned after {} attempt{}: {}",
                                task.name(),
                                chunk_index,
                                attempt,
                                if attempt == 1 { "" } else { "s" },
                                e
                            ));
                            outcome.abandoned_chunks += 1;
                            continue 'chunks;
                        }
                    }
                }
            }
        }
    }

    outcome.items = results.into_values().collect();
    outcome
}

/// Build a user prompt that fits the window, dropping the oldest previous
/// results as needed. `None` when the chunk itself is too large.
fn fit_prompt<T: RefineTask>(
    task: &T,
    chunk: &Chunk,
    results: &IndexMap<MergeKey, T::Item>,
    error_context: Option<&str>,
    system_tokens: usize,
    options: &MapRefineOptions,
) -> Option<String> {
    let previous: Vec<&T::Item> = results.values().collect();
    let fixed = system_tokens + options.max_response_tokens;

    let mut skip = 0;
    loop {
        let user = task.user_prompt(chunk, &previous[skip..], error_context);
        if fixed + estimate_tokens(&user) <= options.max_model_tokens {
            if skip > 0 {
                debug!(
                    stage = task.name(),
                    dropped = skip,
                    kept = previous.len() - skip,
                    "Trimmed previous results to fit budget"
                );
            }
            return Some(user);
        }
        if skip >= previous.len() {
            return None;
        }
        // Drop a quarter of what's left at a time so huge histories shrink quickly
        skip += ((previous.len() - skip) / 4).max(1);
    }
}

/// Split a chunk roughly in half, keeping offsets relative to the original
/// input.
fn split_chunk(chunk: &Chunk, line_oriented: bool) -> Vec<Chunk> {
    let half = chunk.estimated_tokens().div_ceil(2).max(1);
    let pieces = if line_oriented {
        chunk_lines(&chunk.text, half)
    } else {
        chunk_text(&chunk.text, half, 0)
    };

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Chunk {
            start: chunk.start + piece.start,
            end: chunk.start + piece.end,
            overlap: if i == 0 { chunk.overlap.min(piece.text.len()) } else { 0 },
            text: piece.text,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Items are words; previous results are listed in the prompt.
    struct WordTask {
        fail_parse: bool,
        give_up: bool,
        on_error_calls: AtomicUsize,
    }

    impl WordTask {
        fn new() -> Self {
            Self {
                fail_parse: false,
                give_up: false,
                on_error_calls: AtomicUsize::new(0),
            }
        }
    }

    impl RefineTask for WordTask {
        type Item = String;

        fn name(&self) -> &str {
            "words"
        }

        fn system_prompt(&self) -> String {
            "Extract words as a JSON array of strings.".to_string()
        }

        fn user_prompt(&self, chunk: &Chunk, previous: &[&String], error_context: Option<&str>) -> String {
            let mut prompt = String::new();
            if !previous.is_empty() {
                let joined: Vec<&str> = previous.iter().map(|s| s.as_str()).collect();
                prompt.push_str(&format!("Known: {}\n", joined.join(", ")));
            }
            if let Some(ctx) = error_context {
                prompt.push_str(&format!("Fix: {}\n", ctx));
            }
            prompt.push_str(&chunk.text);
            prompt
        }

        fn parse(&self, response: &str, _chunk: &Chunk) -> Result<Vec<String>, ParseError> {
            if self.fail_parse {
                return Err(ParseError::new("always fails", response));
            }
            serde_json::from_str(response).map_err(|e| ParseError::new(e.to_string(), response))
        }

        fn dedupe_key(&self, item: &String) -> Option<String> {
            Some(item.to_lowercase())
        }

        fn on_error(&self, error: &GraphError, _attempt: usize, _chunk: &Chunk) -> Option<String> {
            self.on_error_calls.fetch_add(1, Ordering::SeqCst);
            if self.give_up {
                None
            } else {
                Some(error.to_string())
            }
        }
    }

    fn small_options() -> MapRefineOptions {
        MapRefineOptions {
            max_model_tokens: 400,
            max_response_tokens: 100,
            overhead_ratio: 0.25,
            chunk_overlap_tokens: 0,
            min_chunk_tokens: 16,
            max_retries: 2,
            temperature: 0.0,
        }
    }

    #[test]
    fn test_chunk_budget() {
        let options = small_options();
        assert_eq!(options.usable_tokens(), 300);
        assert_eq!(options.chunk_budget(20), 180);
        assert_eq!(options.chunk_budget(1000), 0);
        assert_eq!(options.system_prompt_budget(), 184);
    }

    #[test]
    fn test_listing_batches_fit_system_budget() {
        let options = small_options();
        let base = "x".repeat(40);
        let lines: Vec<String> = (0..40).map(|_| "a".repeat(39)).collect();

        let batches = listing_batches(&base, &lines, &options);

        assert_eq!(batches, vec![0..15, 15..30, 30..40]);
        for batch in batches {
            let prompt: String = lines[batch].iter().map(|l| format!("{}\n", l)).collect();
            assert!(options.chunk_budget(estimate_tokens(&format!("{}{}", base, prompt))) >= options.min_chunk_tokens);
        }
    }

    #[test]
    fn test_oversized_listing_line_gets_own_batch() {
        let options = small_options();
        let lines = vec!["short".to_string(), "z".repeat(2000), "short".to_string()];

        assert_eq!(listing_batches("", &lines, &options), vec![0..1, 1..2, 2..3]);
        assert!(listing_batches("", &[], &options).is_empty());
    }

    #[tokio::test]
    async fn test_always_failing_parser_yields_empty_result() {
        let llm = MockLlm::new().with_default_response("not json at all");
        let task = WordTask {
            fail_parse: true,
            give_up: true,
            on_error_calls: AtomicUsize::new(0),
        };
        let options = MapRefineOptions {
            max_retries: 1,
            ..small_options()
        };

        let outcome = map_refine(&llm, &task, "some content", &options, None).await;

        assert!(outcome.items.is_empty());
        assert_eq!(outcome.abandoned_chunks, 1);
        assert_eq!(outcome.calls, 1);
        assert_eq!(task.on_error_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_feeds_error_context_back() {
        let llm = MockLlm::new()
            .respond_when_user("Fix:", r#"["alice"]"#)
            .with_default_response("garbage");
        let task = WordTask::new();

        let outcome = map_refine(&llm, &task, "Alice", &small_options(), None).await;

        assert_eq!(outcome.items, vec!["alice".to_string()]);
        assert_eq!(outcome.calls, 2);
        let calls = llm.calls();
        assert!(!calls[0].user_prompt().unwrap_or_default().contains("Fix:"));
        assert!(calls[1].user_prompt().unwrap_or_default().contains("Fix:"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let llm = MockLlm::new().with_default_response("garbage");
        let task = WordTask::new();

        let outcome = map_refine(&llm, &task, "Alice", &small_options(), None).await;

        assert!(outcome.items.is_empty());
        assert_eq!(outcome.calls, 2);
        assert_eq!(outcome.abandoned_chunks, 1);
    }

    #[tokio::test]
    async fn test_dedupe_preserves_first_seen_order() {
        let text = format!("{}\n\n{}", "one two ".repeat(60), "three ".repeat(80));
        let llm = MockLlm::new()
            .respond_when_user("three", r#"["Two", "three"]"#)
            .with_default_response(r#"["one", "two"]"#);
        let task = WordTask::new();

        let outcome = map_refine(&llm, &task, &text, &small_options(), None).await;

        assert!(outcome.chunks_completed >= 2);
        assert_eq!(outcome.items, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_previous_results_reach_later_chunks() {
        let text = format!("{}\n\n{}", "alpha ".repeat(100), "beta ".repeat(100));
        let llm = MockLlm::new()
            .respond_when_user("beta", r#"["beta"]"#)
            .with_default_response(r#"["alpha"]"#);
        let task = WordTask::new();

        map_refine(&llm, &task, &text, &small_options(), None).await;

        let calls = llm.calls();
        assert!(calls.len() >= 2);
        let last = calls.last().and_then(|c| c.user_prompt()).unwrap_or_default().to_string();
        assert!(last.contains("Known: alpha"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_calls() {
        let llm = MockLlm::new().with_default_response(r#"["x"]"#);
        let task = WordTask::new();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = map_refine(&llm, &task, "content", &small_options(), Some(&token)).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.calls, 0);
    }

    #[tokio::test]
    async fn test_unready_model_makes_no_calls() {
        let llm = MockLlm::new().with_ready(false);
        let task = WordTask::new();

        let outcome = map_refine(&llm, &task, "content", &small_options(), None).await;

        assert_eq!(outcome.calls, 0);
        assert_eq!(outcome.errors.len(), 1);
    }

    /// A task whose prompt repeats the chunk, so only splitting can make it fit.
    struct BloatedTask;

    impl RefineTask for BloatedTask {
        type Item = String;

        fn name(&self) -> &str {
            "bloated"
        }

        fn system_prompt(&self) -> String {
            "sys".to_string()
        }

        fn user_prompt(&self, chunk: &Chunk, _previous: &[&String], _error_context: Option<&str>) -> String {
            chunk.text.repeat(2)
        }

        fn parse(&self, _response: &str, chunk: &Chunk) -> Result<Vec<String>, ParseError> {
            Ok(vec![chunk.text.clone()])
        }
    }

    #[tokio::test]
    async fn test_overflow_splits_chunk() {
        // usable 300 - 100 response - 1 system = 199-token chunks; doubled they overflow 400
        let text = "word ".repeat(150);
        let llm = MockLlm::new().with_default_response("ok");

        let outcome = map_refine(&llm, &BloatedTask, &text, &small_options(), None).await;

        assert!(outcome.calls >= 2);
        assert_eq!(outcome.abandoned_chunks, 0);
        assert_eq!(outcome.items.concat(), text);
        for call in llm.calls() {
            let total = estimate_tokens(call.system_prompt().unwrap_or_default())
                + estimate_tokens(call.user_prompt().unwrap_or_default())
                + call.max_tokens;
            assert!(total <= 400);
        }
    }

    #[tokio::test]
    async fn test_overflow_below_floor_abandons() {
        let text = "word ".repeat(150);
        let llm = MockLlm::new().with_default_response("ok");
        let options = MapRefineOptions {
            min_chunk_tokens: 150,
            ..small_options()
        };

        let outcome = map_refine(&llm, &BloatedTask, &text, &options, None).await;

        assert_eq!(outcome.calls, 0);
        assert_eq!(outcome.abandoned_chunks, 1);
        assert!(outcome.items.is_empty());
    }
}
