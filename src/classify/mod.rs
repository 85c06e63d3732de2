//! Message classification: extraction of claim facts and complaint detection.
//!
//! Stages are tried in order and the first success wins:
//! 1. `CacheClassifier`: stored result for identical content
//! 2. `LlmClassifier`: AI backend, bounded by a timeout
//! 3. `RuleClassifier`: regex and keyword rules, cannot fail
//!
//! An AI outage therefore degrades accuracy, never availability.

pub mod cache;
pub mod llm;
pub mod rules;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ClassifierError;
use crate::model::{ComplaintType, Severity, Urgency};

pub use cache::{CacheClassifier, content_hash};
pub use llm::LlmClassifier;
pub use rules::RuleClassifier;

/// The text a classifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub subject: &'a str,
    pub sender: &'a str,
    pub content: &'a str,
}

/// How a result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Ai,
    Fallback,
    Cached,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Fallback => "fallback",
            Self::Cached => "cached",
        }
    }
}

/// Facts extracted from a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub claim_reference: Option<String>,
    pub vehicle_id: Option<String>,
    pub insurer_name_guess: Option<String>,
    pub urgency: Urgency,
    pub requires_attention: bool,
    pub confidence: f32,
    pub method: Method,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplaintSignal {
    pub complaint_type: ComplaintType,
    pub severity: Severity,
    pub keywords: Vec<String>,
}

/// Result of complaint detection, including the negative case so that it
/// can be cached too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplaintAssessment {
    pub signal: Option<ComplaintSignal>,
    pub confidence: f32,
    pub method: Method,
}

/// One classification stage.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(&self, input: &ClassifyInput<'_>) -> Result<Analysis, ClassifierError>;

    async fn assess_complaint(
        &self,
        input: &ClassifyInput<'_>,
    ) -> Result<ComplaintAssessment, ClassifierError>;
}

/// Runs the stage chain and owns the cache write policy.
pub struct ClassificationProvider {
    cache: Option<CacheClassifier>,
    ai: Option<LlmClassifier>,
    rules: RuleClassifier,
    confidence_threshold: f32,
}

impl ClassificationProvider {
    pub fn new(
        cache: Option<CacheClassifier>,
        ai: Option<LlmClassifier>,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            cache,
            ai,
            rules: RuleClassifier,
            confidence_threshold,
        }
    }

    /// Rules only: no cache, no AI.
    pub fn rules_only() -> Self {
        Self::new(None, None, 1.0)
    }

    fn stages(&self) -> Vec<&dyn Classifier> {
        let mut stages: Vec<&dyn Classifier> = Vec::with_capacity(2);
        if let Some(cache) = &self.cache {
            stages.push(cache);
        }
        if let Some(ai) = &self.ai {
            stages.push(ai);
        }
        stages
    }

    /// Extract claim facts. Always returns a result.
    pub async fn analyze(&self, subject: &str, sender: &str, content: &str) -> Analysis {
        let input = ClassifyInput {
            subject,
            sender,
            content,
        };
        for stage in self.stages() {
            match stage.analyze(&input).await {
                Ok(analysis) => {
                    if analysis.method == Method::Ai {
                        self.remember(&input, cache::KIND_ANALYSIS, analysis.confidence, &analysis)
                            .await;
                    }
                    return analysis;
                }
                Err(ClassifierError::CacheMiss) => debug!("Analysis cache miss"),
                Err(e) => warn!(stage = stage.name(), error = %e, "Analysis stage failed, falling back"),
            }
        }
        self.rules.analyze_sync(&input)
    }

    /// Complaint detection with method and confidence. Always returns a result.
    pub async fn assess_complaint(&self, subject: &str, content: &str) -> ComplaintAssessment {
        let input = ClassifyInput {
            subject,
            sender: "",
            content,
        };
        for stage in self.stages() {
            match stage.assess_complaint(&input).await {
                Ok(assessment) => {
                    if assessment.method == Method::Ai {
                        self.remember(
                            &input,
                            cache::KIND_COMPLAINT,
                            assessment.confidence,
                            &assessment,
                        )
                        .await;
                    }
                    return assessment;
                }
                Err(ClassifierError::CacheMiss) => debug!("Complaint cache miss"),
                Err(e) => warn!(stage = stage.name(), error = %e, "Complaint stage failed, falling back"),
            }
        }
        self.rules.assess_complaint_sync(&input)
    }

    pub async fn detect_complaint(&self, subject: &str, content: &str) -> Option<ComplaintSignal> {
        self.assess_complaint(subject, content).await.signal
    }

    /// Cache an AI result if it clears the confidence threshold.
    async fn remember<T: Serialize + Sync>(
        &self,
        input: &ClassifyInput<'_>,
        kind: &str,
        confidence: f32,
        value: &T,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        if confidence < self.confidence_threshold {
            debug!(kind, confidence, "Below caching threshold");
            return;
        }
        if let Err(e) = cache.store(input, kind, confidence, value).await {
            warn!(kind, error = %e, "Failed to cache classification");
        }
    }
}
