//! Email template rendering with `{{variable}}` placeholders.

use crate::error::{EngineError, EngineResult};
use crate::types::EmailTemplate;
use std::collections::HashMap;

/// Strict renderer: every placeholder must resolve, and an unterminated
/// `{{` is an error. Whitespace inside braces is ignored (`{{ name }}`).
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    variables: HashMap<String, String>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Render the subject and bodies of an email template.
    pub fn render(&self, template: &EmailTemplate) -> EngineResult<RenderedMessage> {
        Ok(RenderedMessage {
            subject: self.substitute(&template.subject)?,
            html: self.substitute(&template.body_html)?,
            text: template
                .body_text
                .as_deref()
                .map(|t| self.substitute(t))
                .transpose()?,
        })
    }

    pub fn substitute(&self, input: &str) -> EngineResult<String> {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                EngineError::Render(format!(
                    "unterminated placeholder near '{}'",
                    truncate(&rest[start..], 24)
                ))
            })?;
            let name = after[..end].trim();
            if name.is_empty() {
                return Err(EngineError::Render("empty placeholder".to_string()));
            }
            let value = self
                .variables
                .get(name)
                .ok_or_else(|| EngineError::Render(format!("unknown variable '{name}'")))?;
            output.push_str(value);
            rest = &after[end + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn renderer() -> TemplateRenderer {
        let mut r = TemplateRenderer::new();
        r.set("first_name", "Dana").set("company_name", "Acme Roofing");
        r
    }

    #[test]
    fn test_substitutes_placeholders() {
        let out = renderer()
            .substitute("Hi {{first_name}}, thanks from {{ company_name }}!")
            .unwrap();
        assert_eq!(out, "Hi Dana, thanks from Acme Roofing!");
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let err = renderer().substitute("Hi {{nickname}}").unwrap_err();
        assert!(matches!(err, EngineError::Render(_)));
    }

    #[test]
    fn test_unterminated_placeholder_is_error() {
        let err = renderer().substitute("Hi {{first_name").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_render_template() {
        let template = EmailTemplate {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            name: "check-in".into(),
            sequence_order: 1,
            send_delay_days: 0,
            subject: "{{first_name}}, time for a check-up?".into(),
            body_html: "<p>Hello {{first_name}}</p>".into(),
            body_text: None,
            created_at: Utc::now(),
        };
        let msg = renderer().render(&template).unwrap();
        assert_eq!(msg.subject, "Dana, time for a check-up?");
        assert_eq!(msg.html, "<p>Hello Dana</p>");
        assert!(msg.text.is_none());
    }
}
