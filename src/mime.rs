//! MIME type lookup by file extension

use std::path::Path;

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// MIME type for an extension, with or without the leading dot
pub fn mime_for(extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    mime_guess::from_ext(extension)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// MIME type for a file path
pub fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(".html"), "text/html");
        assert_eq!(mime_for("JSON"), "application/json");
        assert_eq!(mime_for("png"), "image/png");
        assert_eq!(mime_for("unknown"), DEFAULT_MIME);
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(Path::new("/tmp/custom.html")), "text/html");
        assert_eq!(mime_for_path(Path::new("/tmp/app.min.css")), "text/css");
        assert_eq!(mime_for_path(Path::new("/tmp/README")), DEFAULT_MIME);
    }

    #[test]
    fn test_mime_for_path_beyond_common_web_types() {
        assert_ne!(mime_for_path(Path::new("config.yaml")), DEFAULT_MIME);
        assert_eq!(mime_for_path(Path::new("doc.PDF")), "application/pdf");
    }
}
