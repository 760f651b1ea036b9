//! Splitting of oversized prompts into budget-sized parts and recombination of
//! the per-part answers.

use crate::config::ChunkingConfig;
use crate::errors::OrchestrationError;
use crate::providers::{PreparedInput, ProviderAdapter};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tokens held back from each chunk's budget for the "part i of n" note.
const PART_NOTE_TOKENS: usize = 32;

pub type TokenEstimator = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Rough estimate: ~4 characters per token
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as f64 / 4.0).ceil() as usize
}

/// Usable input window once the safety margin is taken off.
pub fn effective_input_limit(model_max_tokens: u32, safety_margin: f64) -> usize {
    let margin = safety_margin.clamp(0.0, 1.0);
    (model_max_tokens as f64 * (1.0 - margin)).floor() as usize
}

#[derive(Clone)]
pub struct ContextChunker {
    estimator: TokenEstimator,
}

impl Default for ContextChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextChunker").finish_non_exhaustive()
    }
}

impl ContextChunker {
    pub fn new() -> Self {
        Self {
            estimator: Arc::new(estimate_tokens),
        }
    }

    pub fn with_estimator(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    pub fn estimate(&self, text: &str) -> usize {
        (self.estimator)(text)
    }

    pub fn estimate_input(&self, input: &PreparedInput) -> usize {
        input.messages.iter().map(|m| self.estimate(&m.content)).sum()
    }

    /// Split `content` into ordered chunks of at most `max_tokens` each.
    ///
    /// Headings are tried first, then paragraphs, then words. A single word
    /// larger than the budget becomes its own chunk.
    pub fn split(&self, content: &str, max_tokens: usize) -> Vec<String> {
        let max_tokens = max_tokens.max(1);
        if self.estimate(content) <= max_tokens {
            return vec![content.to_string()];
        }

        let mut units = Vec::new();
        for section in split_sections(content) {
            if self.estimate(&section) <= max_tokens {
                units.push(section);
                continue;
            }
            for paragraph in split_paragraphs(&section) {
                if self.estimate(&paragraph) <= max_tokens {
                    units.push(paragraph);
                } else {
                    units.extend(self.accumulate(
                        paragraph.split_whitespace().map(str::to_string),
                        " ",
                        max_tokens,
                    ));
                }
            }
        }

        let chunks = self.accumulate(units.into_iter(), "\n\n", max_tokens);
        debug!(chunks = chunks.len(), max_tokens, "Split content into chunks");
        chunks
    }

    fn accumulate(
        &self,
        units: impl Iterator<Item = String>,
        separator: &str,
        max_tokens: usize,
    ) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        for unit in units {
            if unit.trim().is_empty() {
                continue;
            }
            if current.is_empty() {
                current = unit;
                continue;
            }
            let candidate = format!("{current}{separator}{unit}");
            if self.estimate(&candidate) <= max_tokens {
                current = candidate;
            } else {
                chunks.push(std::mem::replace(&mut current, unit));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Merge per-chunk results into one document. A single result is returned as is.
    pub fn combine(&self, results: &[String]) -> String {
        match results {
            [] => String::new(),
            [only] => only.clone(),
            _ => {
                let total = results.len();
                let mut combined = String::new();
                for (i, result) in results.iter().enumerate() {
                    combined.push_str(&format!(
                        "## Section {} of {}\n\n{}\n\n",
                        i + 1,
                        total,
                        result.trim()
                    ));
                }
                combined.push_str(&format!(
                    "---\n\n_Integration note: this document was assembled from {total} \
                     separately processed sections. Review the transitions between \
                     sections for continuity._\n"
                ));
                combined
            }
        }
    }

    /// Call `adapter` with `input`, chunking the last user message when the
    /// whole input exceeds the model's effective limit.
    pub async fn complete_prompt(
        &self,
        adapter: &dyn ProviderAdapter,
        input: &PreparedInput,
        max_output_tokens: u32,
        config: &ChunkingConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let limit = effective_input_limit(adapter.model_max_tokens(), config.safety_margin);
        let total = self.estimate_input(input);
        if total <= limit {
            return adapter.call(input, max_output_tokens).await;
        }

        let index = input.last_user_index().ok_or_else(|| {
            OrchestrationError::Chunking("no user-role message present to split".to_string())
        })?;
        let payload = &input.messages[index].content;
        let overhead = total - self.estimate(payload);
        if overhead + PART_NOTE_TOKENS >= limit {
            return Err(OrchestrationError::Chunking(format!(
                "context outside the user message ({overhead} tokens) leaves no room within the {limit}-token limit"
            ))
            .into());
        }

        let chunks = self.split(payload, limit - overhead - PART_NOTE_TOKENS);
        if chunks.is_empty() {
            return Err(OrchestrationError::Chunking(
                "user message has no content to split".to_string(),
            )
            .into());
        }
        let parts = chunks.len();
        let per_chunk_output = max_output_tokens / parts as u32 + config.output_reserve_tokens;
        info!(
            provider = %adapter.id(),
            estimated_tokens = total,
            limit,
            parts,
            per_chunk_output,
            "Input exceeds model limit, processing in chunks"
        );

        let mut results = Vec::with_capacity(parts);
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled.into()),
                    _ = tokio::time::sleep(config.inter_chunk_delay()) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled.into());
            }

            let mut part = input.clone();
            part.messages[index].content = format!(
                "[Part {} of {}] This is one section of a larger document. \
                 Respond to this section only.\n\n{}",
                i + 1,
                parts,
                chunk
            );
            results.push(adapter.call(&part, per_chunk_output).await?);
        }

        Ok(self.combine(&results))
    }
}

/// Cut before every markdown heading line.
fn split_sections(content: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if line.trim_start().starts_with('#') && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn split_paragraphs(section: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in section.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn word_estimator() -> ContextChunker {
        ContextChunker::with_estimator(Arc::new(|s: &str| s.split_whitespace().count()))
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_effective_input_limit() {
        assert_eq!(effective_input_limit(8_000, 0.1), 7_200);
        assert_eq!(effective_input_limit(128_000, 0.0), 128_000);
    }

    #[test]
    fn test_under_budget_is_identity() {
        let chunker = ContextChunker::new();
        let content = "# Title\n\nshort body";
        let chunks = chunker.split(content, 1_000);
        assert_eq!(chunks, vec![content.to_string()]);
        assert_eq!(chunker.combine(&chunks), content);
    }

    #[test]
    fn test_splits_on_headings_first() {
        let chunker = word_estimator();
        let content = "# One\nalpha beta gamma\n# Two\ndelta epsilon zeta\n# Three\neta theta iota";
        let chunks = chunker.split(content, 5);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("# One"));
        assert!(chunks[1].starts_with("# Two"));
        assert!(chunks[2].starts_with("# Three"));
    }

    #[test]
    fn test_oversized_section_falls_back_to_paragraphs_and_words() {
        let chunker = word_estimator();
        let content = "# Big\none two three\n\nfour five six seven eight nine ten eleven";
        let chunks = chunker.split(content, 4);

        assert!(chunks.iter().all(|c| chunker.estimate(c) <= 4));
        let produced: HashSet<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
        for token in content.split_whitespace() {
            assert!(produced.contains(token), "missing token {token}");
        }
    }

    #[test]
    fn test_complete_prompt_without_user_message() {
        let mut adapter = crate::providers::MockProviderAdapter::new();
        adapter.expect_model_max_tokens().return_const(100u32);
        adapter
            .expect_call()
            .times(1)
            .returning(|_, max_output| Ok(format!("max={max_output}")));

        let chunker = word_estimator();
        let config = ChunkingConfig::default();
        let cancel = CancellationToken::new();

        tokio_test::block_on(async {
            let small = PreparedInput::new().with_user("hello there");
            let answer = chunker
                .complete_prompt(&adapter, &small, 256, &config, &cancel)
                .await
                .expect("fits the window");
            assert_eq!(answer, "max=256");

            let oversized = PreparedInput::new().with_system("word ".repeat(500));
            let err = chunker
                .complete_prompt(&adapter, &oversized, 256, &config, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<OrchestrationError>(),
                Some(OrchestrationError::Chunking(_))
            ));
        });
    }

    #[test]
    fn test_blank_oversized_payload_is_rejected() {
        let mut adapter = crate::providers::MockProviderAdapter::new();
        adapter.expect_model_max_tokens().return_const(100u32);
        adapter.expect_call().never();

        let chunker = ContextChunker::new();
        assert!(chunker.split(&" ".repeat(2_000), 50).is_empty());

        let config = ChunkingConfig::default();
        let cancel = CancellationToken::new();
        tokio_test::block_on(async {
            let blank = PreparedInput::new().with_user(" ".repeat(2_000));
            let err = chunker
                .complete_prompt(&adapter, &blank, 256, &config, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<OrchestrationError>(),
                Some(OrchestrationError::Chunking(_))
            ));
        });
    }

    #[test]
    fn test_combine_labels_each_section() {
        let chunker = ContextChunker::new();
        let combined = chunker.combine(&["first".to_string(), "second".to_string()]);
        assert!(combined.contains("## Section 1 of 2\n\nfirst"));
        assert!(combined.contains("## Section 2 of 2\n\nsecond"));
        assert!(combined.contains("Integration note"));
    }
}
