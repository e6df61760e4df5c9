//! Renders a `NotificationMessage` into channel-ready subject/body text.
//!
//! Substitution is a flat `{{field}}` replace over `message.metadata`,
//! applied to both the title and body before any channel-specific
//! formatting (e.g. the email digest wrapper in `batch.rs`). An unresolved
//! token is left intact rather than rejected -- the renderer never fails.

use aegis_common::model::NotificationMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
}

pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, message: &NotificationMessage) -> RenderedContent {
        RenderedContent {
            subject: Self::substitute(&message.title, message),
            body: Self::substitute(&message.body, message),
        }
    }

    fn substitute(template: &str, message: &NotificationMessage) -> String {
        let mut out = template.to_string();
        for (key, value) in &message.metadata {
            let placeholder = format!("{{{{{key}}}}}");
            out = out.replace(&placeholder, value);
        }
        out
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::model::Level;

    #[test]
    fn substitutes_known_fields_and_leaves_unknown_untouched() {
        let mut msg = NotificationMessage::new(
            "orders",
            Level::Info,
            "Order {{order_id}} filled",
            "Filled {{qty}} at {{missing}}",
        );
        msg.metadata.insert("order_id".to_string(), "42".to_string());
        msg.metadata.insert("qty".to_string(), "1.5".to_string());

        let renderer = TemplateRenderer::new();
        let rendered = renderer.render(&msg);

        assert_eq!(rendered.subject, "Order 42 filled");
        assert_eq!(rendered.body, "Filled 1.5 at {{missing}}");
    }
}
