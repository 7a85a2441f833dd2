//! Deterministic, collision-free naming for export outputs.

use std::collections::HashSet;
use std::path::Path;

use slug::slugify;

/// Sanitize a suggested artifact name into `stem.ext` form, slugifying the
/// stem and lowercasing the extension.
pub fn sanitize_entry_name(suggested: &str) -> String {
    let path = Path::new(suggested);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("artifact");
    let mut base = slugify(stem);
    if base.is_empty() {
        base = "artifact".to_string();
    }

    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    match extension {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

/// Return a sanitized name unique within `used`, appending a sequence suffix
/// before the extension on collision.
pub fn unique_entry_name(suggested: &str, used: &mut HashSet<String>) -> String {
    let sanitized = sanitize_entry_name(suggested);
    if used.insert(sanitized.clone()) {
        return sanitized;
    }

    let (stem, extension) = match sanitized.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), Some(ext.to_string())),
        None => (sanitized, None),
    };

    let mut sequence = 2usize;
    loop {
        let candidate = match extension.as_deref() {
            Some(ext) => format!("{stem}-{sequence}.{ext}"),
            None => format!("{stem}-{sequence}"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        sequence += 1;
    }
}
