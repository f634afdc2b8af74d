//! Trend candidate sources.
//!
//! A source returns raw candidates; the deduplicator and scorer decide
//! what survives. Partial source failure is expected and handled by the
//! monitor, so implementations just surface errors.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{http_error, PipelineError};

/// A raw trend candidate from one source.
#[derive(Debug, Clone)]
pub struct TrendCandidate {
    pub topic: String,
    pub keywords: Vec<String>,
    pub source: String,
    /// Source-local popularity hint used to pick the surviving topic
    /// string when candidates merge.
    pub score_hint: f64,
    pub source_data: serde_json::Value,
}

#[async_trait]
pub trait TrendSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self) -> Result<Vec<TrendCandidate>, PipelineError>;
}

/// Reddit rising-posts source.
pub struct RedditSource {
    client: reqwest::Client,
    subreddits: Vec<String>,
}

impl RedditSource {
    pub fn new(user_agent: &str) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .map_err(|err| PipelineError::api("reddit", err))?;
        Ok(Self {
            client,
            subreddits: vec![
                "memes".to_string(),
                "aww".to_string(),
                "popculturechat".to_string(),
            ],
        })
    }
}

#[derive(Deserialize)]
struct RedditListing {
    data: RedditListingData,
}

#[derive(Deserialize)]
struct RedditListingData {
    children: Vec<RedditChild>,
}

#[derive(Deserialize)]
struct RedditChild {
    data: RedditPost,
}

#[derive(Deserialize)]
struct RedditPost {
    title: String,
    #[serde(default)]
    ups: f64,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    permalink: String,
}

fn title_keywords(title: &str) -> Vec<String> {
    title
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.len() > 2)
        .collect()
}

#[async_trait]
impl TrendSource for RedditSource {
    fn name(&self) -> &'static str {
        "reddit"
    }

    async fn fetch(&self) -> Result<Vec<TrendCandidate>, PipelineError> {
        let mut candidates = Vec::new();
        for subreddit in &self.subreddits {
            let url = format!("https://www.reddit.com/r/{subreddit}/rising.json?limit=15");
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|err| http_error("reddit", err))?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(PipelineError::api("reddit", format!("{url} -> {status}")));
            }
            let listing: RedditListing = response
                .json()
                .await
                .map_err(|err| http_error("reddit", err))?;
            for child in listing.data.children {
                let post = child.data;
                if post.title.is_empty() {
                    continue;
                }
                candidates.push(TrendCandidate {
                    keywords: title_keywords(&post.title),
                    source: "reddit".to_string(),
                    score_hint: post.ups,
                    source_data: serde_json::json!({
                        "subreddit": post.subreddit,
                        "permalink": post.permalink,
                        "ups": post.ups,
                    }),
                    topic: post.title,
                });
            }
        }
        Ok(candidates)
    }
}

/// Daily search-trends source.
pub struct SearchTrendsSource {
    client: reqwest::Client,
    endpoint: String,
}

impl SearchTrendsSource {
    pub fn new() -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::api("search", err))?;
        Ok(Self {
            client,
            endpoint: "https://trends.google.com/trends/api/dailytrends?geo=US".to_string(),
        })
    }
}

#[async_trait]
impl TrendSource for SearchTrendsSource {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn fetch(&self) -> Result<Vec<TrendCandidate>, PipelineError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|err| http_error("search", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api("search", format!("daily trends {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|err| http_error("search", err))?;
        // The endpoint prefixes its JSON with an XSSI guard line.
        let json_start = body.find('{').unwrap_or(0);
        let payload: serde_json::Value = serde_json::from_str(&body[json_start..])
            .map_err(|err| PipelineError::Validation(format!("trends payload: {err}")))?;

        let mut candidates = Vec::new();
        let days = payload["default"]["trendingSearchesDays"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for day in days {
            for search in day["trendingSearches"].as_array().cloned().unwrap_or_default() {
                let Some(title) = search["title"]["query"].as_str() else {
                    continue;
                };
                let traffic = search["formattedTraffic"]
                    .as_str()
                    .and_then(|t| t.trim_end_matches(['+', 'K', 'M']).parse::<f64>().ok())
                    .unwrap_or(0.0);
                candidates.push(TrendCandidate {
                    topic: title.to_string(),
                    keywords: title_keywords(title),
                    source: "search".to_string(),
                    score_hint: traffic,
                    source_data: serde_json::json!({ "traffic": traffic }),
                });
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_keywords_drops_short_tokens_and_punctuation() {
        let keywords = title_keywords("A Cute Baby Hippo, at the zoo!");
        assert_eq!(keywords, vec!["cute", "baby", "hippo", "the", "zoo"]);
    }
}
