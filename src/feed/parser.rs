use anyhow::Result;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::util::clean_html;

/// A media URL advertised by a feed entry, before the extractor picks
/// representatives.
#[derive(Debug, Clone)]
pub struct MediaCandidate {
    pub url: String,
    /// MIME type as declared by the feed, e.g. "image/jpeg".
    pub content_type: Option<String>,
    /// Declared size in bytes, if any.
    pub size: Option<u64>,
}

/// Transient parse result for one feed entry.
///
/// Created per fetch pass and discarded after dedup/persist; never stored.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub guid: String,
    /// Entry title, HTML-stripped.
    pub title: String,
    /// Entry body (summary or content), HTML-stripped.
    pub content: String,
    pub link: Option<String>,
    /// Publication timestamp (unix seconds), if the feed declared one.
    pub published: Option<i64>,
    pub media: Vec<MediaCandidate>,
}

/// Parse a feed document into raw entries, in feed-document order.
///
/// Titles and bodies are cleaned of markup here so every downstream stage
/// (dedup, translation, publication) sees plain text.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<RawEntry>> {
    let feed = parser::parse(bytes)?;

    let entries: Vec<RawEntry> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let title = clean_html(
                &entry
                    .title
                    .map(|t| t.content)
                    .unwrap_or_default(),
            );
            let content = clean_html(
                &entry
                    .summary
                    .map(|s| s.content)
                    .or_else(|| entry.content.and_then(|c| c.body))
                    .unwrap_or_default(),
            );

            let media = entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .filter_map(|mc| {
                    mc.url.as_ref().map(|url| MediaCandidate {
                        url: url.to_string(),
                        content_type: mc.content_type.as_ref().map(|ct| ct.to_string()),
                        size: mc.size,
                    })
                })
                .collect();

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let guid = generate_guid(existing_id, link.as_deref(), &title, published);

            RawEntry {
                guid,
                title,
                content,
                link,
                published,
                media,
            }
        })
        .collect();

    Ok(entries)
}

fn generate_guid(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
