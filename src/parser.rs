//! Reference extraction from documents.
//!
//! The graph builder does not understand any document format itself. It asks
//! a [`ReferenceParser`] for the raw reference tokens of a document and
//! classifies them on its own. [`MarkdownParser`] is the stock parser: it
//! walks the `pulldown-cmark` event stream and collects image and link
//! destinations, plus `src` attributes of inline `<img>` tags.

use pulldown_cmark::{Event, Parser, Tag};

/// How a reference appeared in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceHint {
    /// Embedded image (`![alt](target)` or `<img src>`).
    Image,
    /// Plain link (`[text](target)`).
    Link,
}

/// A reference token exactly as written in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    pub target: String,
    pub hint: ReferenceHint,
}

impl RawReference {
    pub fn image(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            hint: ReferenceHint::Image,
        }
    }

    pub fn link(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            hint: ReferenceHint::Link,
        }
    }
}

/// Extracts raw reference tokens from a document's text.
pub trait ReferenceParser: Send + Sync {
    fn extract(&self, text: &str) -> Vec<RawReference>;
}

/// Markdown reference parser backed by `pulldown-cmark`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownParser;

impl ReferenceParser for MarkdownParser {
    fn extract(&self, text: &str) -> Vec<RawReference> {
        let mut refs = Vec::new();
        for event in Parser::new(text) {
            match event {
                Event::Start(Tag::Image { dest_url, .. }) => {
                    refs.push(RawReference::image(dest_url.to_string()));
                }
                Event::Start(Tag::Link { dest_url, .. }) => {
                    refs.push(RawReference::link(dest_url.to_string()));
                }
                Event::Html(html) | Event::InlineHtml(html) => {
                    refs.extend(img_sources(&html).map(RawReference::image));
                }
                _ => {}
            }
        }
        refs
    }
}

/// `src` values of `<img>` tags in an HTML fragment.
fn img_sources(html: &str) -> impl Iterator<Item = String> + '_ {
    html.match_indices("<img")
        .filter_map(move |(start, _)| {
            let tag = &html[start..];
            let tag = &tag[..tag.find('>').unwrap_or(tag.len())];
            attribute_value(tag, "src")
        })
        .map(str::to_string)
}

/// Value of attribute `name`. The name must follow whitespace, so `src`
/// never matches inside `data-src`.
fn attribute_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=");
    let (pos, _) = tag.match_indices(&needle).find(|&(pos, _)| {
        tag[..pos]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace)
    })?;
    let rest = &tag[pos + needle.len()..];
    let quote = rest.chars().next()?;
    if quote == '"' || quote == '\'' {
        let rest = &rest[1..];
        rest.find(quote).map(|end| &rest[..end])
    } else {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        Some(rest[..end].trim_end_matches('/'))
    }
}
