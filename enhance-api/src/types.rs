//! Shared value types.

use std::path::Path;

/// Image extensions accepted by the upload endpoint.
///
/// Matching is case-insensitive: `photo.JPG` and `photo.jpg` are both accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageExtension {
    Jpg,
    Jpeg,
    Png,
}

impl ImageExtension {
    /// Parses an extension, with or without its leading dot.
    pub fn from_extension(extension: &str) -> Option<Self> {
        let bare = extension.strip_prefix('.').unwrap_or(extension);
        match bare.to_ascii_lowercase().as_str() {
            "jpg" => Some(ImageExtension::Jpg),
            "jpeg" => Some(ImageExtension::Jpeg),
            "png" => Some(ImageExtension::Png),
            _ => None,
        }
    }
}

/// Checks the extension of an uploaded filename against the allow-list.
///
/// `Ok` carries the extension exactly as the client sent it, dot included, and staged files keep
/// that spelling (`.JPG` stays `.JPG`). `Err` carries whatever extension the name had, if any.
pub fn accepted_extension(filename: &str) -> Result<String, Option<String>> {
    match original_extension(filename) {
        Some(extension) if ImageExtension::from_extension(&extension).is_some() => Ok(extension),
        other => Err(other),
    }
}

fn original_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_allowed_extensions_in_any_case() {
        for name in ["a.jpg", "a.JPG", "a.Jpeg", "b.jpeg", "c.png", "c.PNG", "dir.v2/photo.pNg"] {
            assert!(accepted_extension(name).is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn test_rejects_other_extensions() {
        for name in ["a.gif", "a.txt", "noext", "", ".png", "archive.png.zip", "a.webp"] {
            assert!(accepted_extension(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn test_parsed_variant() {
        assert_eq!(ImageExtension::from_extension(".JPEG"), Some(ImageExtension::Jpeg));
        assert_eq!(ImageExtension::from_extension("jpg"), Some(ImageExtension::Jpg));
        assert_eq!(ImageExtension::from_extension(".Png"), Some(ImageExtension::Png));
        assert_eq!(ImageExtension::from_extension(".bmp"), None);
    }

    #[test]
    fn test_accepted_extension_preserves_case() {
        assert_eq!(accepted_extension("Holiday.JPG"), Ok(".JPG".to_string()));
        assert_eq!(accepted_extension("scan.Jpeg"), Ok(".Jpeg".to_string()));
    }

    #[test]
    fn test_rejection_carries_original_extension() {
        assert_eq!(accepted_extension("clip.GIF"), Err(Some(".GIF".to_string())));
        assert_eq!(accepted_extension("noext"), Err(None));
    }
}
