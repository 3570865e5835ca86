//! LLM judge adapter.
//!
//! Scores answers for relevancy, quality, and faithfulness on a 0.0–1.0
//! scale. Availability is resolved once per run into a [`JudgeCapability`]:
//! a disabled judge or missing credentials degrade the run to
//! structural-only scoring instead of failing it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::JudgeConfig;
use crate::error::JudgeError;
use crate::types::Reference;

const JUDGE_SYSTEM_PROMPT: &str =
    "You are a strict evaluator of retrieval-augmented answers. Respond only with the requested JSON object.";

/// Scores returned by one judge call, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JudgeScores {
    pub relevancy: f64,
    pub quality: f64,
    /// Only produced when retrieved context was available to judge against.
    pub faithfulness: Option<f64>,
}

impl JudgeScores {
    /// Mean of the sub-scores that were produced.
    pub fn overall(&self) -> f64 {
        match self.faithfulness {
            Some(f) => (self.relevancy + self.quality + f) / 3.0,
            None => (self.relevancy + self.quality) / 2.0,
        }
    }
}

/// One answered question presented to the judge.
#[derive(Debug, Clone)]
pub struct JudgeRequest<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    pub context: &'a str,
    pub references: &'a [Reference],
}

/// An external judge implementation.
#[async_trait]
pub trait JudgeProvider: Send + Sync {
    async fn score(&self, request: JudgeRequest<'_>) -> Result<JudgeScores, JudgeError>;

    /// Identifier used in logs.
    fn name(&self) -> &str;
}

/// Judge availability for one run, resolved up front and never re-probed
/// mid-run.
#[derive(Clone)]
pub enum JudgeCapability {
    Available(Arc<dyn JudgeProvider>),
    Unavailable { reason: String },
}

impl JudgeCapability {
    /// Resolve availability from configuration. A disabled judge or missing
    /// credentials yield `Unavailable` with a human-readable reason.
    pub fn resolve(config: &JudgeConfig) -> JudgeCapability {
        if !config.enabled {
            return JudgeCapability::Unavailable {
                reason: "judge disabled in configuration".to_string(),
            };
        }
        match LlmJudge::new(config) {
            Ok(judge) => JudgeCapability::Available(Arc::new(judge)),
            Err(e) => JudgeCapability::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    /// Wrap an already-constructed provider.
    pub fn available(provider: Arc<dyn JudgeProvider>) -> JudgeCapability {
        JudgeCapability::Available(provider)
    }

    pub fn unavailable(reason: impl Into<String>) -> JudgeCapability {
        JudgeCapability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, JudgeCapability::Available(_))
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match self {
            JudgeCapability::Available(_) => None,
            JudgeCapability::Unavailable { reason } => Some(reason),
        }
    }
}

impl std::fmt::Debug for JudgeCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JudgeCapability::Available(provider) => {
                write!(f, "JudgeCapability::Available({})", provider.name())
            }
            JudgeCapability::Unavailable { reason } => {
                write!(f, "JudgeCapability::Unavailable({})", reason)
            }
        }
    }
}

/// Judge backed by an OpenAI-compatible chat completions endpoint.
pub struct LlmJudge {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmJudge {
    /// Create a judge from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`.
    pub fn new(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| JudgeError::MissingCredentials {
                reason: format!("environment variable '{}' not set", config.api_key_env),
            })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| JudgeError::ApiRequest {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn build_prompt(request: &JudgeRequest<'_>, with_context: bool) -> String {
        let references = if request.references.is_empty() {
            "None specified".to_string()
        } else {
            Reference::format_list(request.references)
        };

        let mut prompt = format!(
            r#"Evaluate this answer produced by a retrieval-augmented answering service.

QUESTION: {}

ANSWER: {}

EXPECTED SOURCE SECTIONS: {}
"#,
            request.question, request.answer, references
        );

        if with_context {
            prompt.push_str(&format!("\nRETRIEVED CONTEXT:\n{}\n", request.context));
        }

        prompt.push_str(
            "\nScore these dimensions on a 0.0-1.0 scale:\n\
             - relevancy: does the answer address the question asked?\n\
             - quality: is the answer correct, complete, and clearly written?\n",
        );
        if with_context {
            prompt.push_str(
                "- faithfulness: is every claim in the answer grounded in the retrieved context?\n",
            );
            prompt.push_str(
                "\nRespond with JSON only: {\"relevancy\": 0.0, \"quality\": 0.0, \"faithfulness\": 0.0}",
            );
        } else {
            prompt.push_str("\nRespond with JSON only: {\"relevancy\": 0.0, \"quality\": 0.0}");
        }
        prompt
    }

    fn parse_scores(content: &str) -> Result<JudgeScores, JudgeError> {
        let raw: RawScores =
            serde_json::from_str(extract_json(content)).map_err(|e| JudgeError::ResponseParse {
                message: format!("Invalid judge JSON: {} (response: {})", e, content),
            })?;
        Ok(JudgeScores {
            relevancy: raw.relevancy.clamp(0.0, 1.0),
            quality: raw.quality.clamp(0.0, 1.0),
            faithfulness: raw.faithfulness.map(|f| f.clamp(0.0, 1.0)),
        })
    }
}

#[async_trait]
impl JudgeProvider for LlmJudge {
    async fn score(&self, request: JudgeRequest<'_>) -> Result<JudgeScores, JudgeError> {
        let with_context = !request.context.trim().is_empty();
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": JUDGE_SYSTEM_PROMPT },
                { "role": "user", "content": Self::build_prompt(&request, with_context) },
            ],
            "temperature": 0.0,
            "stream": false,
        });

        debug!(url = %url, model = %self.model, "Sending judge request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| JudgeError::ApiRequest {
                message: format!("Request failed: {}", e),
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| JudgeError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(JudgeError::ApiRequest {
                message: format!("HTTP {}: {}", status, response_body),
            });
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| JudgeError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| JudgeError::ResponseParse {
                message: "Response has no message content".to_string(),
            })?;

        let mut scores = Self::parse_scores(content)?;
        if !with_context {
            // Faithfulness is meaningless without context, even if the
            // model volunteered one.
            scores.faithfulness = None;
        }
        Ok(scores)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct RawScores {
    relevancy: f64,
    quality: f64,
    #[serde(default)]
    faithfulness: Option<f64>,
}

/// Extract the JSON object from a response that may wrap it in markdown
/// fences or prose.
fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_overall_is_mean_of_produced_scores() {
        let scores = JudgeScores {
            relevancy: 0.9,
            quality: 0.6,
            faithfulness: Some(0.3),
        };
        assert!((scores.overall() - 0.6).abs() < 1e-9);

        let scores = JudgeScores {
            relevancy: 0.9,
            quality: 0.6,
            faithfulness: None,
        };
        assert!((scores.overall() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"relevancy": 1.0}"#), r#"{"relevancy": 1.0}"#);
        assert_eq!(
            extract_json("```json\n{\"relevancy\": 1.0}\n```"),
            r#"{"relevancy": 1.0}"#
        );
        assert_eq!(
            extract_json("Here is my evaluation: {\"relevancy\": 1.0} as requested."),
            r#"{"relevancy": 1.0}"#
        );
    }

    #[test]
    fn test_parse_scores_clamps_out_of_range() {
        let scores = LlmJudge::parse_scores(
            r#"{"relevancy": 1.4, "quality": -0.2, "faithfulness": 0.5}"#,
        )
        .unwrap();
        assert_eq!(scores.relevancy, 1.0);
        assert_eq!(scores.quality, 0.0);
        assert_eq!(scores.faithfulness, Some(0.5));
    }

    #[test]
    fn test_parse_scores_rejects_non_json() {
        let err = LlmJudge::parse_scores("I would rate this highly.").unwrap_err();
        assert!(matches!(err, JudgeError::ResponseParse { .. }));
    }

    #[test]
    fn test_resolve_disabled_judge() {
        let config = JudgeConfig {
            enabled: false,
            ..Default::default()
        };
        let capability = JudgeCapability::resolve(&config);
        assert!(!capability.is_available());
        assert_eq!(
            capability.unavailable_reason(),
            Some("judge disabled in configuration")
        );
    }

    #[test]
    fn test_resolve_missing_credentials() {
        let config = JudgeConfig {
            api_key_env: "RAGPROBE_TEST_JUDGE_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        let capability = JudgeCapability::resolve(&config);
        assert!(!capability.is_available());
        let reason = capability.unavailable_reason().unwrap();
        assert!(reason.contains("RAGPROBE_TEST_JUDGE_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_prompt_includes_context_section_only_with_context() {
        let references = Reference::parse_list("docA|Intro");
        let request = JudgeRequest {
            question: "What is the boot order?",
            answer: "BIOS, loader, kernel.",
            context: "BIOS hands off to the loader.",
            references: &references,
        };
        let with = LlmJudge::build_prompt(&request, true);
        assert!(with.contains("RETRIEVED CONTEXT"));
        assert!(with.contains("faithfulness"));

        let without = LlmJudge::build_prompt(&request, false);
        assert!(!without.contains("RETRIEVED CONTEXT"));
        assert!(!without.contains("faithfulness"));
    }
}
