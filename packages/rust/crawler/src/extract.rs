//! Visible-text and in-scope link extraction from fetched HTML.

use scraper::{Html, Selector};

use darkscout_shared::{DarkscoutError, Result};

/// Elements whose text is never rendered.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Text and links pulled out of one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPage {
    pub text: String,
    pub links: Vec<String>,
}

/// Parse `html` and extract its text and the links containing `marker`.
pub fn parse_page(html: &str, marker: &str) -> Result<ExtractedPage> {
    let doc = Html::parse_document(html);
    Ok(ExtractedPage {
        text: extract_text(&doc),
        links: extract_links(&doc, marker)?,
    })
}

/// All rendered text, tags stripped and whitespace collapsed to single spaces.
pub fn extract_text(doc: &Html) -> String {
    let mut words: Vec<&str> = Vec::new();

    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }

    words.join(" ")
}

/// `href` values containing `marker`, in document order, duplicates kept.
pub fn extract_links(doc: &Html, marker: &str) -> Result<Vec<String>> {
    let link_sel = Selector::parse("a[href]")
        .map_err(|e| DarkscoutError::parse(format!("invalid link selector: {e:?}")))?;

    Ok(doc
        .select(&link_sel)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| href.contains(marker))
        .map(str::to_string)
        .collect())
}
