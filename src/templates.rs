//! Outbound email templates with `{{name}}` placeholders.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::error::TemplateError;
use crate::store::Database;

pub const NEW_JOB_ACKNOWLEDGMENT: &str = "new_job_acknowledgment";
pub const COMPLAINT_ACKNOWLEDGMENT: &str = "complaint_acknowledgment";
pub const COMPLAINT_ALERT: &str = "complaint_alert";
pub const REPAIRER_ACKNOWLEDGMENT: &str = "repairer_acknowledgment";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Built-in `(subject, body)` for a template name.
fn builtin(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        NEW_JOB_ACKNOWLEDGMENT => Some((
            "Instruction received: {{claim_reference}}",
            "Dear {{sender_name}},\n\n\
             Thank you for your instruction regarding claim {{claim_reference}}.\n\n\
             {{commitment}}. Our target for first contact is {{deadline}}.\n\n\
             Kind regards,\nClaims Team",
        )),
        COMPLAINT_ACKNOWLEDGMENT => Some((
            "Your concern regarding {{claim_reference}}",
            "Dear {{sender_name}},\n\n\
             We are sorry to hear about your experience with claim {{claim_reference}}. \
             Your message has been passed to a senior member of the team, who will \
             contact you shortly.\n\n\
             Kind regards,\nClaims Team",
        )),
        COMPLAINT_ALERT => Some((
            "[{{severity}}] Complaint received from {{sender}}",
            "A complaint has been detected.\n\n\
             Sender: {{sender}}\n\
             Subject: {{subject}}\n\
             Claim reference: {{claim_reference}}\n\
             Type: {{complaint_type}}\n\
             Severity: {{severity}}\n\n\
             Excerpt:\n{{excerpt}}",
        )),
        REPAIRER_ACKNOWLEDGMENT => Some((
            "Received: {{subject}}",
            "Dear {{sender_name}},\n\n\
             Thank you for your submission. It has been received and will be \
             reviewed by an engineer.\n\n\
             Kind regards,\nClaims Team",
        )),
        _ => None,
    }
}

/// Substitute `{{name}}` placeholders, reporting any left unresolved.
pub fn render_text(text: &str, vars: &HashMap<String, String>) -> (String, Vec<String>) {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER.replace_all(text, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match vars.get(key) {
            Some(v) => v.clone(),
            None => {
                if !missing.iter().any(|m| m == key) {
                    missing.push(key.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    (rendered.into_owned(), missing)
}

/// A rendered message ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Render a template. Never returns text containing an unresolved placeholder.
    async fn render(
        &self,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<RenderedEmail, TemplateError>;
}

/// Reads `email_templates` rows, falling back to the built-in set.
pub struct DbTemplateStore {
    db: Arc<dyn Database>,
}

impl DbTemplateStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TemplateStore for DbTemplateStore {
    async fn render(
        &self,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<RenderedEmail, TemplateError> {
        let (subject, body) = match self.db.get_template(name).await? {
            Some(row) => row,
            None => {
                let (s, b) = builtin(name).ok_or_else(|| TemplateError::NotFound(name.into()))?;
                (s.to_string(), b.to_string())
            }
        };

        let (subject, mut missing) = render_text(&subject, vars);
        let (body, body_missing) = render_text(&body, vars);
        for m in body_missing {
            if !missing.contains(&m) {
                missing.push(m);
            }
        }

        if !missing.is_empty() {
            return Err(TemplateError::Unresolved {
                template: name.to_string(),
                placeholders: missing,
            });
        }
        Ok(RenderedEmail { subject, body })
    }
}
