//! Trend scoring through the LLM client.
//!
//! One batched call scores up to the daily cap of candidates. Exactly one
//! retry layer lives here: three total attempts at this call site, with
//! validation failures treated the same as transport failures. There is
//! deliberately no second retry wrapper around this path.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clients::llm::{LlmClient, TopicScore};
use crate::error::PipelineError;
use crate::trends::dedup::CanonicalCandidate;

/// Minimum overall score for a candidate to qualify.
pub const OVERALL_THRESHOLD: f64 = 7.0;

const SCORE_ATTEMPTS: u32 = 3;

/// A candidate with validated scores attached.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: CanonicalCandidate,
    pub velocity: i32,
    pub commercial: i32,
    pub safety: i32,
    pub uniqueness: i32,
    pub overall: f64,
    pub reasoning: String,
}

/// Token usage accumulated for the cost estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

fn validate_score(score: &TopicScore, batch_len: usize) -> Result<(), PipelineError> {
    if score.index >= batch_len {
        return Err(PipelineError::Validation(format!(
            "score index {} out of range for batch of {batch_len}",
            score.index
        )));
    }
    for (name, value) in [
        ("velocity", score.velocity),
        ("commercial", score.commercial),
        ("safety", score.safety),
        ("uniqueness", score.uniqueness),
    ] {
        if !(1..=10).contains(&value) {
            return Err(PipelineError::Validation(format!(
                "{name} score {value} outside 1-10"
            )));
        }
    }
    if !(1.0..=10.0).contains(&score.overall) {
        return Err(PipelineError::Validation(format!(
            "overall score {} outside 1.0-10.0",
            score.overall
        )));
    }
    Ok(())
}

pub struct TrendScorer {
    llm: Arc<dyn LlmClient>,
    threshold: f64,
}

impl TrendScorer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            threshold: OVERALL_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Score the batch and keep candidates at or above the threshold.
    /// Returns the qualifying candidates sorted best-first, plus token
    /// usage for the cost estimate.
    pub async fn score_and_filter(
        &self,
        candidates: Vec<CanonicalCandidate>,
    ) -> Result<(Vec<ScoredCandidate>, ScoreUsage), PipelineError> {
        if candidates.is_empty() {
            return Ok((Vec::new(), ScoreUsage::default()));
        }
        let topics: Vec<String> = candidates.iter().map(|c| c.topic.clone()).collect();

        let mut usage = ScoreUsage::default();
        let mut last_err: Option<PipelineError> = None;

        for attempt in 1..=SCORE_ATTEMPTS {
            let response = match self.llm.batch_score(&topics).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(attempt, error = %err, "batch scoring attempt failed");
                    last_err = Some(err);
                    continue;
                }
            };
            usage.input_tokens += response.input_tokens;
            usage.output_tokens += response.output_tokens;

            match self.apply_scores(&candidates, &response.scores) {
                Ok(scored) => {
                    info!(
                        scored = topics.len(),
                        qualified = scored.len(),
                        attempt,
                        "batch scoring complete"
                    );
                    return Ok((scored, usage));
                }
                Err(err) => {
                    warn!(attempt, error = %err, "batch score payload invalid");
                    last_err = Some(err);
                }
            }
        }

        Err(PipelineError::RetryExhausted {
            attempts: SCORE_ATTEMPTS,
            last: Box::new(last_err.expect("at least one attempt ran")),
        })
    }

    fn apply_scores(
        &self,
        candidates: &[CanonicalCandidate],
        scores: &[TopicScore],
    ) -> Result<Vec<ScoredCandidate>, PipelineError> {
        let mut qualified = Vec::new();
        for score in scores {
            validate_score(score, candidates.len())?;
            if score.overall < self.threshold {
                continue;
            }
            qualified.push(ScoredCandidate {
                candidate: candidates[score.index].clone(),
                velocity: score.velocity,
                commercial: score.commercial,
                safety: score.safety,
                uniqueness: score.uniqueness,
                overall: score.overall,
                reasoning: score.reasoning.clone(),
            });
        }
        qualified.sort_by(|a, b| {
            b.overall
                .partial_cmp(&a.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(qualified)
    }
}
