use std::path::Path;
use thiserror::Error;

/// Longest extension carried over to a staged file name
const MAX_EXTENSION_LEN: usize = 8;

/// Longest display filename kept, in bytes
const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

/// Sanitizes a client supplied filename for display and for naming artifacts.
///
/// Only the last path component survives, control and reserved characters
/// become `_`, and the result is capped at 255 bytes. Never fails: an empty
/// or hidden-only name falls back to `upload`.
pub fn sanitize_filename(filename: &str) -> String {
    // Treat both separators as path separators regardless of platform
    let last = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    if last != filename.trim() {
        tracing::warn!("Path components stripped from uploaded filename: {:?}", filename);
    }

    let sanitized: String = last
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = sanitized.trim_start_matches('.').to_string();
    if sanitized.is_empty() {
        return "upload".to_string();
    }

    // Limit length safely for UTF-8
    if sanitized.len() > MAX_FILENAME_LEN {
        let mut end = MAX_FILENAME_LEN;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    }
}

/// Lowercase extension safe to reuse in a staged file name, if any.
pub fn staged_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Filename without its extension, used to derive artifact names.
pub fn file_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document")
        .to_string()
}

/// Drops parameters and normalizes case: `Application/PDF; x=y` -> `application/pdf`
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Detects the MIME type from magic bytes
pub fn sniff_mime(header: &[u8]) -> Option<&'static str> {
    infer::get(header).map(|kind| kind.mime_type())
}

/// Parses a 1-based page selection such as `1-3,5` against a document with
/// `page_count` pages. Out-of-range pages are skipped; duplicates are kept in
/// request order only once.
pub fn parse_page_ranges(selection: &str, page_count: u32) -> Result<Vec<u32>, ValidationError> {
    let invalid = |part: &str| ValidationError {
        code: "INVALID_PAGES",
        message: format!("Invalid page selection '{}'", part),
    };

    let mut pages = Vec::new();
    for part in selection.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (
                a.trim().parse::<u32>().map_err(|_| invalid(part))?,
                b.trim().parse::<u32>().map_err(|_| invalid(part))?,
            ),
            None => {
                let page = part.parse::<u32>().map_err(|_| invalid(part))?;
                (page, page)
            }
        };

        if start > end {
            return Err(invalid(part));
        }

        for page in start..=end.min(page_count) {
            if page >= 1 && !pages.contains(&page) {
                pages.push(page);
            }
        }
    }

    Ok(pages)
}
