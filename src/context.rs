//! Content context classification and systematic bias derivation.
//!
//! The classifier maps raw content to a [`ProblemContext`] using pattern
//! heuristics, optionally refined by one provider call for domain detection.
//! The derived [`SystematicBias`] turns that context into processing
//! priorities and termination criteria for the rest of the pipeline.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::provider::{CompletionConfig, RetryingProvider};

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```|(?m)^ {4,}\S").unwrap());
static NUMERIC_CLAIM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\s*(%|percent|km|kg|ms|years?|million|billion)\b").unwrap());
static INSTRUCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:\d+[.)]|[-*])\s+|\b(must|should|shall|first|then|finally)\b").unwrap()
});
static CREATIVE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(imagine|story|poem|fiction|brainstorm|creative)\b").unwrap()
});
static HIGH_STAKES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(medical|diagnos\w*|legal|contract|financ\w*|safety|dosage|liabilit\w*)\b")
        .unwrap()
});
static CRITICAL_STAKES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(life.threatening|emergency|overdose|lethal|critical system)\b").unwrap()
});

/// Broad type of problem the content poses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Assertions about the world that can be checked
    Factual,
    /// Step-by-step instructions or procedures
    Procedural,
    /// Open-ended or creative writing
    Creative,
    /// Reasoning or argumentation
    Analytical,
    /// Source code or configuration
    Code,
    /// Nothing distinctive detected
    General,
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factual => write!(f, "factual"),
            Self::Procedural => write!(f, "procedural"),
            Self::Creative => write!(f, "creative"),
            Self::Analytical => write!(f, "analytical"),
            Self::Code => write!(f, "code"),
            Self::General => write!(f, "general"),
        }
    }
}

/// How much is riding on the validation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stakes {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Stakes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Boolean traits detected in the content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextCharacteristics {
    /// Content makes claims that need factual checking
    pub requires_factual_accuracy: bool,
    /// Content tolerates or invites creative latitude
    pub allows_creativity: bool,
    /// Content contains code blocks
    pub contains_code: bool,
    /// Content contains quantitative claims
    pub contains_numeric_claims: bool,
    /// Content reads as instructions to follow
    pub is_instructional: bool,
    /// Content has multiple distinguishable parts
    pub multi_part: bool,
}

/// Classified context for one validation request. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemContext {
    /// Broad problem type
    pub context_type: ContextType,
    /// Subject domain ("general" when undetected)
    pub domain: String,
    /// Stakes level
    pub stakes: Stakes,
    /// Detected boolean traits
    pub characteristics: ContextCharacteristics,
    /// Additional metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl ProblemContext {
    /// Default context used when classification fails open.
    pub fn general() -> Self {
        Self {
            context_type: ContextType::General,
            domain: "general".to_string(),
            stakes: Stakes::Medium,
            characteristics: ContextCharacteristics::default(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Termination criteria derived from context stakes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminationCriteria {
    /// Maximum processing time in milliseconds
    pub max_processing_time_ms: u64,
    /// Quality score considered sufficient for this context
    pub sufficiency_threshold: f64,
    /// Maximum refinement iterations
    pub max_iterations: u32,
}

/// Per-context weighting of processing priorities.
///
/// Derived deterministically from a [`ProblemContext`]; all weights are
/// clamped to [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystematicBias {
    /// Weight on factual accuracy
    pub factual_accuracy: f64,
    /// Weight on conservativeness (prefer cautious interpretations)
    pub conservativeness: f64,
    /// Allowance for creative latitude
    pub creativity_allowance: f64,
    /// Derived termination criteria
    pub termination_criteria: TerminationCriteria,
}

impl SystematicBias {
    /// Derive bias weights from a classified context.
    pub fn from_context(context: &ProblemContext) -> Self {
        let stakes_factor = match context.stakes {
            Stakes::Low => 0.0,
            Stakes::Medium => 0.15,
            Stakes::High => 0.3,
            Stakes::Critical => 0.45,
        };

        let mut factual_accuracy: f64 = 0.5 + stakes_factor;
        let mut creativity_allowance: f64 = 0.3;

        if context.characteristics.requires_factual_accuracy {
            factual_accuracy += 0.15;
        }
        if context.characteristics.allows_creativity {
            creativity_allowance += 0.4;
        }
        if context.context_type == ContextType::Creative {
            factual_accuracy -= 0.2;
        }

        let conservativeness: f64 = 0.4 + stakes_factor;

        let termination_criteria = match context.stakes {
            Stakes::Low => TerminationCriteria {
                max_processing_time_ms: 15_000,
                sufficiency_threshold: 0.65,
                max_iterations: 2,
            },
            Stakes::Medium => TerminationCriteria {
                max_processing_time_ms: 30_000,
                sufficiency_threshold: 0.75,
                max_iterations: 3,
            },
            Stakes::High => TerminationCriteria {
                max_processing_time_ms: 60_000,
                sufficiency_threshold: 0.85,
                max_iterations: 4,
            },
            Stakes::Critical => TerminationCriteria {
                max_processing_time_ms: 120_000,
                sufficiency_threshold: 0.9,
                max_iterations: 5,
            },
        };

        Self {
            factual_accuracy: factual_accuracy.clamp(0.0, 1.0),
            conservativeness: conservativeness.clamp(0.0, 1.0),
            creativity_allowance: creativity_allowance.clamp(0.0, 1.0),
            termination_criteria,
        }
    }
}

/// Classifies raw content into a [`ProblemContext`].
///
/// Classification is heuristic-first; when a provider is attached it is
/// consulted once for domain detection, and any provider error falls open
/// to the heuristic result. Classification never aborts the pipeline.
pub struct ContextClassifier {
    provider: Option<Arc<RetryingProvider>>,
}

impl ContextClassifier {
    /// Heuristic-only classifier.
    pub fn new() -> Self {
        Self { provider: None }
    }

    /// Classifier that refines the domain via one provider call.
    pub fn with_provider(provider: Arc<RetryingProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// Classify content. Deterministic for identical input given identical
    /// provider state.
    pub async fn classify(&self, content: &str) -> ProblemContext {
        let mut context = self.classify_heuristic(content);

        if let Some(provider) = &self.provider {
            match self.detect_domain(provider, content).await {
                Ok(Some(domain)) => context.domain = domain,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "domain detection failed, keeping heuristic context");
                }
            }
        }

        context
    }

    fn classify_heuristic(&self, content: &str) -> ProblemContext {
        let characteristics = ContextCharacteristics {
            requires_factual_accuracy: NUMERIC_CLAIM.is_match(content)
                || HIGH_STAKES.is_match(content),
            allows_creativity: CREATIVE_MARKER.is_match(content),
            contains_code: CODE_BLOCK.is_match(content),
            contains_numeric_claims: NUMERIC_CLAIM.is_match(content),
            is_instructional: INSTRUCTION.is_match(content),
            multi_part: content.split("\n\n").filter(|p| !p.trim().is_empty()).count() > 1,
        };

        let context_type = if characteristics.contains_code {
            ContextType::Code
        } else if characteristics.allows_creativity {
            ContextType::Creative
        } else if characteristics.is_instructional {
            ContextType::Procedural
        } else if characteristics.contains_numeric_claims
            || characteristics.requires_factual_accuracy
        {
            ContextType::Factual
        } else if characteristics.multi_part {
            ContextType::Analytical
        } else {
            ContextType::General
        };

        let stakes = if CRITICAL_STAKES.is_match(content) {
            Stakes::Critical
        } else if HIGH_STAKES.is_match(content) {
            Stakes::High
        } else if characteristics.requires_factual_accuracy {
            Stakes::Medium
        } else {
            Stakes::Low
        };

        ProblemContext {
            context_type,
            domain: "general".to_string(),
            stakes,
            characteristics,
            metadata: None,
        }
    }

    async fn detect_domain(
        &self,
        provider: &RetryingProvider,
        content: &str,
    ) -> crate::error::Result<Option<String>> {
        let excerpt: String = content.chars().take(800).collect();
        let prompt = format!(
            "Classify the subject domain of the following content in one lowercase word \
             (e.g. medicine, law, software, finance, science, general).\n\n{}",
            excerpt
        );

        let config = CompletionConfig::default()
            .with_temperature(0.0)
            .with_max_tokens(8);
        let completion = provider.complete(&prompt, &config).await?;

        let word = completion
            .text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_alphabetic())
            .to_lowercase();

        if word.is_empty() || word.len() > 24 {
            return Ok(None);
        }
        Ok(Some(word))
    }
}

impl Default for ContextClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[tokio::test]
    async fn test_factual_content_classification() {
        let classifier = ContextClassifier::new();
        let ctx = classifier
            .classify("The Amazon river is 6400 km long.")
            .await;

        assert_eq!(ctx.context_type, ContextType::Factual);
        assert!(ctx.characteristics.contains_numeric_claims);
        assert_eq!(ctx.stakes, Stakes::Medium);
    }

    #[tokio::test]
    async fn test_code_content_classification() {
        let classifier = ContextClassifier::new();
        let ctx = classifier
            .classify("Here is the fix:\n```rust\nfn main() {}\n```")
            .await;

        assert_eq!(ctx.context_type, ContextType::Code);
    }

    #[tokio::test]
    async fn test_high_stakes_detection() {
        let classifier = ContextClassifier::new();
        let ctx = classifier
            .classify("The recommended dosage for this medical treatment is 20 mg daily.")
            .await;

        assert!(ctx.stakes >= Stakes::High);
    }

    #[tokio::test]
    async fn test_provider_refines_domain() {
        let provider = Arc::new(RetryingProvider::new(
            Arc::new(MockProvider::new().push_text("medicine", 0.9)),
            0,
        ));
        let classifier = ContextClassifier::with_provider(provider);
        let ctx = classifier.classify("Aspirin reduces fever.").await;

        assert_eq!(ctx.domain, "medicine");
    }

    #[tokio::test]
    async fn test_provider_failure_fails_open() {
        let provider = Arc::new(RetryingProvider::new(
            Arc::new(MockProvider::always_unavailable()),
            0,
        ));
        let classifier = ContextClassifier::with_provider(provider);
        let ctx = classifier.classify("Some plain statement.").await;

        // Classification still succeeds with the heuristic result.
        assert_eq!(ctx.domain, "general");
    }

    #[test]
    fn test_bias_weights_in_range() {
        for stakes in [Stakes::Low, Stakes::Medium, Stakes::High, Stakes::Critical] {
            let mut ctx = ProblemContext::general();
            ctx.stakes = stakes;
            ctx.characteristics.requires_factual_accuracy = true;

            let bias = SystematicBias::from_context(&ctx);
            assert!((0.0..=1.0).contains(&bias.factual_accuracy));
            assert!((0.0..=1.0).contains(&bias.conservativeness));
            assert!((0.0..=1.0).contains(&bias.creativity_allowance));
        }
    }

    #[test]
    fn test_bias_is_deterministic() {
        let ctx = ProblemContext::general();
        assert_eq!(
            SystematicBias::from_context(&ctx),
            SystematicBias::from_context(&ctx)
        );
    }

    #[test]
    fn test_critical_stakes_tighten_termination() {
        let mut low = ProblemContext::general();
        low.stakes = Stakes::Low;
        let mut critical = ProblemContext::general();
        critical.stakes = Stakes::Critical;

        let low_bias = SystematicBias::from_context(&low);
        let critical_bias = SystematicBias::from_context(&critical);

        assert!(
            critical_bias.termination_criteria.sufficiency_threshold
                > low_bias.termination_criteria.sufficiency_threshold
        );
        assert!(
            critical_bias.termination_criteria.max_iterations
                > low_bias.termination_criteria.max_iterations
        );
    }
}
