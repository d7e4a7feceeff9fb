use std::borrow::Cow;

/// Strips HTML tags, decodes common entities, and collapses whitespace.
///
/// Feed entry titles and bodies routinely arrive wrapped in markup; the
/// pipeline compares, embeds, and translates plain text only, so everything
/// downstream of the parser goes through this function first.
///
/// # Examples
///
/// ```
/// use firefeed::util::clean_html;
///
/// assert_eq!(clean_html("<p>Hello <b>world</b></p>"), "Hello world");
/// assert_eq!(clean_html("Tom &amp; Jerry"), "Tom & Jerry");
/// assert_eq!(clean_html("  spaced\n\nout  "), "spaced out");
/// ```
pub fn clean_html(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let mut text = String::with_capacity(raw.len());
    let mut in_tag = false;
    for ch in raw.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }

    let text = decode_entities(&text);

    // Collapse runs of whitespace (including newlines) into single spaces
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Decodes the named and numeric HTML entities that occur in feed text.
fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let semi = match rest.find(';') {
            // Entities are short; a distant semicolon means a bare ampersand
            Some(i) if i <= 10 => i,
            _ => {
                out.push('&');
                rest = &rest[1..];
                continue;
            }
        };

        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Counts whitespace-separated words.
///
/// Used by the fetcher to drop entries whose title or content fall below the
/// configured minimum word counts.
pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Truncates to at most `max_chars` characters on a char boundary.
///
/// The duplicate detector embeds the title plus a bounded slice of content;
/// byte-index truncation would panic on multi-byte UTF-8.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
