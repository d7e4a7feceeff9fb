use super::parser::MediaCandidate;

/// Which kind of media wins when an entry carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPreference {
    ImageFirst,
    VideoFirst,
}

/// Selection policy for [`extract_media`].
#[derive(Debug, Clone, Copy)]
pub struct MediaPolicy {
    pub preference: MediaPreference,
    /// Videos above this declared size are skipped. Candidates without a
    /// declared size pass the check.
    pub max_video_bytes: u64,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            preference: MediaPreference::ImageFirst,
            max_video_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Representative media for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedMedia {
    pub image_url: Option<String>,
    pub video_url: Option<String>,
}

/// Pick at most one image and one video from an entry's media candidates.
///
/// Pure over its inputs: no network access, no probing of the URLs. The
/// first candidate of each kind in document order wins, which matches how
/// feeds list their primary media first.
pub fn extract_media(candidates: &[MediaCandidate], policy: &MediaPolicy) -> ExtractedMedia {
    let image_url = candidates
        .iter()
        .find(|c| kind_of(c) == Some(MediaKind::Image))
        .map(|c| c.url.clone());

    let video_url = candidates
        .iter()
        .find(|c| {
            kind_of(c) == Some(MediaKind::Video)
                && c.size.map(|s| s <= policy.max_video_bytes).unwrap_or(true)
        })
        .map(|c| c.url.clone());

    match policy.preference {
        MediaPreference::ImageFirst if image_url.is_some() => ExtractedMedia {
            image_url,
            video_url: None,
        },
        MediaPreference::VideoFirst if video_url.is_some() => ExtractedMedia {
            image_url: None,
            video_url,
        },
        _ => ExtractedMedia {
            image_url,
            video_url,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
}

fn kind_of(candidate: &MediaCandidate) -> Option<MediaKind> {
    if let Some(ct) = &candidate.content_type {
        if ct.starts_with("image/") {
            return Some(MediaKind::Image);
        }
        if ct.starts_with("video/") {
            return Some(MediaKind::Video);
        }
    }

    // No declared type: fall back to the URL extension
    let path = candidate.url.split(['?', '#']).next().unwrap_or("");
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => Some(MediaKind::Image),
        "mp4" | "webm" | "mov" | "m4v" => Some(MediaKind::Video),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn candidate(url: &str, content_type: Option<&str>, size: Option<u64>) -> MediaCandidate {
        MediaCandidate {
            url: url.to_string(),
            content_type: content_type.map(String::from),
            size,
        }
    }

    #[test]
    fn test_first_image_wins() {
        let candidates = vec![
            candidate("https://example.com/a.jpg", Some("image/jpeg"), None),
            candidate("https://example.com/b.png", Some("image/png"), None),
        ];
        let media = extract_media(&candidates, &MediaPolicy::default());
        assert_eq!(media.image_url.as_deref(), Some("https://example.com/a.jpg"));
    }

    #[test]
    fn test_image_first_suppresses_video() {
        let candidates = vec![
            candidate("https://example.com/clip.mp4", Some("video/mp4"), Some(1024)),
            candidate("https://example.com/a.jpg", Some("image/jpeg"), None),
        ];
        let media = extract_media(&candidates, &MediaPolicy::default());
        assert_eq!(media.image_url.as_deref(), Some("https://example.com/a.jpg"));
        assert_eq!(media.video_url, None);
    }

    #[test]
    fn test_video_first_preference() {
        let candidates = vec![
            candidate("https://example.com/a.jpg", Some("image/jpeg"), None),
            candidate("https://example.com/clip.mp4", Some("video/mp4"), Some(1024)),
        ];
        let policy = MediaPolicy {
            preference: MediaPreference::VideoFirst,
            ..MediaPolicy::default()
        };
        let media = extract_media(&candidates, &policy);
        assert_eq!(media.video_url.as_deref(), Some("https://example.com/clip.mp4"));
        assert_eq!(media.image_url, None);
    }

    #[test]
    fn test_oversized_video_skipped() {
        let policy = MediaPolicy {
            preference: MediaPreference::VideoFirst,
            max_video_bytes: 1000,
        };
        let candidates = vec![
            candidate("https://example.com/huge.mp4", Some("video/mp4"), Some(2000)),
            candidate("https://example.com/small.mp4", Some("video/mp4"), Some(500)),
        ];
        let media = extract_media(&candidates, &policy);
        assert_eq!(
            media.video_url.as_deref(),
            Some("https://example.com/small.mp4")
        );
    }

    #[test]
    fn test_extension_fallback_when_type_missing() {
        let candidates = vec![candidate("https://example.com/photo.JPG?w=800", None, None)];
        let media = extract_media(&candidates, &MediaPolicy::default());
        assert_eq!(
            media.image_url.as_deref(),
            Some("https://example.com/photo.JPG?w=800")
        );
    }

    #[test]
    fn test_no_candidates() {
        let media = extract_media(&[], &MediaPolicy::default());
        assert_eq!(media, ExtractedMedia::default());
    }
}
