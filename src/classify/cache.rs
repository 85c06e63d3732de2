//! Classification cache stage backed by `classification_cache`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::classify::{Analysis, ClassifyInput, Classifier, ComplaintAssessment, Method};
use crate::error::ClassifierError;
use crate::store::{CachedClassification, Database};

pub const KIND_ANALYSIS: &str = "analysis";
pub const KIND_COMPLAINT: &str = "complaint";

/// SHA-256 over the normalised subject, sender and content.
///
/// Case and whitespace runs are folded so trivially reformatted copies of the
/// same message share an entry.
pub fn content_hash(input: &ClassifyInput<'_>) -> String {
    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalize(input.subject).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(input.sender).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(input.content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First stage: returns a stored result or `CacheMiss`.
pub struct CacheClassifier {
    db: Arc<dyn Database>,
    version: String,
}

impl CacheClassifier {
    pub fn new(db: Arc<dyn Database>, version: impl Into<String>) -> Self {
        Self {
            db,
            version: version.into(),
        }
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        input: &ClassifyInput<'_>,
        kind: &str,
    ) -> Result<T, ClassifierError> {
        let hash = content_hash(input);
        let Some(entry) = self
            .db
            .get_cached_classification(&hash, &self.version, kind)
            .await?
        else {
            return Err(ClassifierError::CacheMiss);
        };

        let value: T = match serde_json::from_str(&entry.result) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind, error = %e, "Discarding unreadable cache entry");
                return Err(ClassifierError::CacheMiss);
            }
        };

        // Hit counting is best-effort.
        if let Err(e) = self.db.record_cache_hit(&hash, &self.version, kind).await {
            debug!(error = %e, "Cache hit counter not updated");
        }
        Ok(value)
    }

    /// Store a result under the input's key. Existing entries are kept.
    pub async fn store<T: Serialize>(
        &self,
        input: &ClassifyInput<'_>,
        kind: &str,
        confidence: f32,
        value: &T,
    ) -> Result<(), ClassifierError> {
        let result = serde_json::to_string(value)
            .map_err(|e| ClassifierError::Malformed(format!("serialize cache entry: {e}")))?;
        let entry = CachedClassification {
            content_hash: content_hash(input),
            classifier_version: self.version.clone(),
            kind: kind.to_string(),
            result,
            confidence,
            hit_count: 0,
            created_at: Utc::now(),
        };
        self.db.put_cached_classification(&entry).await?;
        Ok(())
    }
}

#[async_trait]
impl Classifier for CacheClassifier {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn analyze(&self, input: &ClassifyInput<'_>) -> Result<Analysis, ClassifierError> {
        let mut analysis: Analysis = self.lookup(input, KIND_ANALYSIS).await?;
        analysis.method = Method::Cached;
        Ok(analysis)
    }

    async fn assess_complaint(
        &self,
        input: &ClassifyInput<'_>,
    ) -> Result<ComplaintAssessment, ClassifierError> {
        let mut assessment: ComplaintAssessment = self.lookup(input, KIND_COMPLAINT).await?;
        assessment.method = Method::Cached;
        Ok(assessment)
    }
}
