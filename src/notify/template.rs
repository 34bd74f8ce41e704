//! Urgency-tiered message templates.
//!
//! Templates use `{placeholder}` substitution. Whatever the template says,
//! the rendered message is guaranteed to carry the response URL; a donor
//! who can't respond is a wasted notification.

use serde::{Deserialize, Serialize};

use crate::domain::blood::PriorityTier;

/// Message bodies per priority tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplates {
    pub normal: String,
    pub high_priority: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            normal: "Hi {donor_name}, {hospital} needs {quantity} unit(s) of {blood_type} blood \
                     (urgency: {urgency}). Can you help? Respond here: {response_url}"
                .to_string(),
            high_priority: "URGENT: Hi {donor_name}, {hospital} urgently needs {quantity} unit(s) \
                            of {blood_type} blood ({urgency}). Please respond now: {response_url}"
                .to_string(),
        }
    }
}

impl MessageTemplates {
    /// Template body for a priority tier.
    pub fn for_tier(&self, tier: PriorityTier) -> &str {
        match tier {
            PriorityTier::Normal => &self.normal,
            PriorityTier::High => &self.high_priority,
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone)]
pub struct MessageContext<'a> {
    pub hospital: &'a str,
    pub blood_type: &'a str,
    pub quantity: u32,
    pub urgency: &'a str,
    pub donor_name: &'a str,
    pub response_url: &'a str,
}

/// Render a template, substituting placeholders and guaranteeing the result
/// contains the response URL (appended when the template omitted it).
pub fn render(template: &str, ctx: &MessageContext<'_>) -> String {
    let mut body = template
        .replace("{hospital}", ctx.hospital)
        .replace("{blood_type}", ctx.blood_type)
        .replace("{quantity}", &ctx.quantity.to_string())
        .replace("{urgency}", ctx.urgency)
        .replace("{donor_name}", ctx.donor_name)
        .replace("{response_url}", ctx.response_url);

    if !body.contains(ctx.response_url) {
        body.push_str("\nRespond here: ");
        body.push_str(ctx.response_url);
    }
    body
}
