//! AI-backed classification stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::classify::rules::{normalize_claim_reference, normalize_vehicle_id};
use crate::classify::{
    Analysis, ClassifyInput, Classifier, ComplaintAssessment, ComplaintSignal, Method,
};
use crate::error::ClassifierError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::model::{ComplaintType, Severity, Urgency};

/// Max tokens for a classification call (small JSON reply).
const CLASSIFY_MAX_TOKENS: u32 = 400;

const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Body characters sent to the model.
const CONTENT_PREVIEW_CHARS: usize = 3000;

pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    async fn call(&self, system: String, user: String) -> Result<String, ClassifierError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| ClassifierError::Timeout(self.timeout))??;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Classification call complete"
        );
        Ok(response.content)
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn name(&self) -> &'static str {
        "ai"
    }

    async fn analyze(&self, input: &ClassifyInput<'_>) -> Result<Analysis, ClassifierError> {
        let raw = self
            .call(build_analysis_system_prompt(), build_user_prompt(input))
            .await?;
        parse_analysis_response(&raw).inspect_err(|e| {
            warn!(raw_response = %raw, error = %e, "Unparseable analysis response");
        })
    }

    async fn assess_complaint(
        &self,
        input: &ClassifyInput<'_>,
    ) -> Result<ComplaintAssessment, ClassifierError> {
        let raw = self
            .call(build_complaint_system_prompt(), build_user_prompt(input))
            .await?;
        parse_complaint_response(&raw).inspect_err(|e| {
            warn!(raw_response = %raw, error = %e, "Unparseable complaint response");
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_analysis_system_prompt() -> String {
    "You extract structured facts from emails sent to a motor insurance assessment company.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"claim_reference\": \"...\" or null, \"vehicle_id\": \"...\" or null, \
     \"insurer_name\": \"...\" or null, \"urgency\": \"urgent\" or \"normal\", \
     \"requires_attention\": true/false, \"confidence\": 0.0}\n\n\
     Rules:\n\
     - claim_reference: the insurer's claim reference exactly as written. Use null if absent \
       or a placeholder such as UNKNOWN, TBC or N/A\n\
     - vehicle_id: UK registration or 17-character VIN, uppercase without spaces\n\
     - urgency: \"urgent\" only if the sender explicitly asks for priority handling\n\
     - confidence: how sure you are of the extraction (0.0-1.0)"
        .to_string()
}

fn build_complaint_system_prompt() -> String {
    "You decide whether an email to a motor insurance assessment company is a complaint.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"is_complaint\": true/false, \"complaint_type\": \"delay|communication|service_quality|valuation|escalation|general\", \
     \"severity\": \"low|medium|high\", \"keywords\": [\"...\"], \"confidence\": 0.0}\n\n\
     Rules:\n\
     - high: mentions the ombudsman, FCA, solicitors, legal action or a formal complaint\n\
     - medium: clearly angry or asks for escalation\n\
     - low: mild dissatisfaction\n\
     - Routine status requests are not complaints\n\
     - Omit complaint_type and severity when is_complaint is false"
        .to_string()
}

fn build_user_prompt(input: &ClassifyInput<'_>) -> String {
    let content_preview: String = input.content.chars().take(CONTENT_PREVIEW_CHARS).collect();
    format!(
        "From: {}\nSubject: {}\n\nMessage:\n{}",
        input.sender, input.subject, content_preview
    )
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    claim_reference: Option<String>,
    #[serde(default)]
    vehicle_id: Option<String>,
    #[serde(default)]
    insurer_name: Option<String>,
    #[serde(default)]
    urgency: String,
    #[serde(default)]
    requires_attention: bool,
    #[serde(default)]
    confidence: f32,
}

fn parse_analysis_response(raw: &str) -> Result<Analysis, ClassifierError> {
    let json_str = extract_json_object(raw);
    let response: AnalysisResponse = serde_json::from_str(&json_str)
        .map_err(|e| ClassifierError::Malformed(format!("JSON parse error: {e}")))?;

    let urgency = match response.urgency.to_lowercase().as_str() {
        "urgent" | "high" => Urgency::Urgent,
        _ => Urgency::Normal,
    };

    Ok(Analysis {
        claim_reference: response
            .claim_reference
            .as_deref()
            .and_then(normalize_claim_reference),
        vehicle_id: response.vehicle_id.as_deref().and_then(normalize_vehicle_id),
        insurer_name_guess: response
            .insurer_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        urgency,
        requires_attention: response.requires_attention,
        confidence: response.confidence.clamp(0.0, 1.0),
        method: Method::Ai,
    })
}

#[derive(Debug, serde::Deserialize)]
struct ComplaintResponse {
    is_complaint: bool,
    #[serde(default)]
    complaint_type: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

fn parse_complaint_response(raw: &str) -> Result<ComplaintAssessment, ClassifierError> {
    let json_str = extract_json_object(raw);
    let response: ComplaintResponse = serde_json::from_str(&json_str)
        .map_err(|e| ClassifierError::Malformed(format!("JSON parse error: {e}")))?;

    let signal = if response.is_complaint {
        let severity = response
            .severity
            .parse::<Severity>()
            .map_err(ClassifierError::Malformed)?;
        Some(ComplaintSignal {
            complaint_type: response
                .complaint_type
                .parse()
                .unwrap_or(ComplaintType::General),
            severity,
            keywords: response.keywords,
        })
    } else {
        None
    };

    Ok(ComplaintAssessment {
        signal,
        confidence: response.confidence.clamp(0.0, 1.0),
        method: Method::Ai,
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
