//! Response transformation hooks.
//!
//! The HTML/CSS/text processors themselves are injected collaborators:
//! each is a buffered body → body function with declared options.  The
//! defaults pass the body through unchanged.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// The widget container option of the HTML processor.
    pub container: bool,
}

pub type HtmlProcessor = Box<dyn Fn(Bytes, &ProcessOptions) -> Bytes>;
pub type CssProcessor = Box<dyn Fn(Bytes) -> Bytes>;
pub type TextProcessor = Box<dyn Fn(Bytes) -> Bytes>;

pub struct ProcessorRegistry {
    pub html: HtmlProcessor,
    pub css: CssProcessor,
    pub text: TextProcessor,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        ProcessorRegistry {
            html: Box::new(|body, _| body),
            css: Box::new(|body| body),
            text: Box::new(|body| body),
        }
    }
}

/// Content types the HTML processor accepts.
pub fn html_processable(content_type: Option<&str>) -> bool {
    matches!(
        content_type.map(|ct| ct.split(';').next().unwrap_or(ct).trim()),
        Some("text/html") | Some("text/xml") | Some("application/xhtml+xml") | Some("application/xml")
    )
}

/// Content types the CSS processor accepts.
pub fn css_processable(content_type: Option<&str>) -> bool {
    matches!(
        content_type.map(|ct| ct.split(';').next().unwrap_or(ct).trim()),
        Some("text/css")
    )
}

/// Only text/* responses go through the text processor.
pub fn text_processable(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.trim_start().starts_with("text/"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_processors_are_identity() {
        let registry = ProcessorRegistry::default();
        let body = Bytes::from_static(b"<html/>");
        let out = (registry.html)(body.clone(), &ProcessOptions::default());
        assert_eq!(out, body);
        assert_eq!((registry.css)(body.clone()), body);
        assert_eq!((registry.text)(body.clone()), body);
    }

    #[test]
    fn processable_content_types() {
        assert!(html_processable(Some("text/html")));
        assert!(html_processable(Some("text/html; charset=utf-8")));
        assert!(!html_processable(Some("image/png")));
        assert!(!html_processable(None));

        assert!(css_processable(Some("text/css")));
        assert!(!css_processable(Some("text/html")));

        assert!(text_processable(Some("text/plain")));
        assert!(text_processable(Some("text/html")));
        assert!(!text_processable(Some("application/json")));
    }
}
