//! Namespaces and validated asset paths.
//!
//! Every path that reaches the store or the origin goes through
//! [`AssetPath::parse`] first, so traversal attempts are rejected before any
//! filesystem or network I/O happens.

use crate::error::{Result, VcServeError};
use std::fmt;
use std::path::PathBuf;

/// Suffix used for in-progress cache writes. Lookups never resolve to it.
pub const TEMP_SUFFIX: &str = ".vcpart";

/// One of the two independent asset collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Vcsky,
    Vcbr,
}

impl Namespace {
    /// URL prefix and default directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Vcsky => "vcsky",
            Namespace::Vcbr => "vcbr",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, slash-separated relative path inside a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetPath(String);

/// `C:` style prefix on a leading segment.
fn has_drive_prefix(segment: &str) -> bool {
    matches!(segment.as_bytes(), [drive, b':', ..] if drive.is_ascii_alphabetic())
}

impl AssetPath {
    /// Validate and normalize a raw request path.
    ///
    /// Empty and `.` segments are dropped. Rejects `..`, backslashes, NUL
    /// bytes, a drive prefix on the first segment, and names ending in
    /// [`TEMP_SUFFIX`].
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.contains('\0') || raw.contains('\\') {
            return Err(VcServeError::PathRejected(raw.to_string()));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(VcServeError::PathRejected(raw.to_string())),
                s if segments.is_empty() && has_drive_prefix(s) => {
                    return Err(VcServeError::PathRejected(raw.to_string()));
                }
                s => segments.push(s),
            }
        }

        let Some(last) = segments.last() else {
            return Err(VcServeError::PathRejected(raw.to_string()));
        };
        if last.ends_with(TEMP_SUFFIX) {
            return Err(VcServeError::PathRejected(raw.to_string()));
        }

        Ok(AssetPath(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Lowercased extension of the final segment, if any.
    pub fn extension(&self) -> Option<String> {
        self.file_name()
            .rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty())
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }

    /// Relative filesystem path built segment by segment.
    pub fn to_relative_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for AssetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_nested_paths() {
        let path = AssetPath::parse("audio/sfx/RADIO.bin").unwrap();
        assert_eq!(path.as_str(), "audio/sfx/RADIO.bin");
        assert_eq!(path.file_name(), "RADIO.bin");
        assert_eq!(path.extension().as_deref(), Some("bin"));
    }

    #[test]
    fn drops_empty_and_dot_segments() {
        let path = AssetPath::parse("/models//./gta3.img").unwrap();
        assert_eq!(path.as_str(), "models/gta3.img");
    }

    #[test]
    fn rejects_parent_segments() {
        for raw in ["..", "../secret", "a/../../b", "a/.."] {
            assert!(
                matches!(AssetPath::parse(raw), Err(VcServeError::PathRejected(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn dots_inside_names_are_fine() {
        assert!(AssetPath::parse("a..b/file...txt").is_ok());
    }

    #[test]
    fn rejects_backslash_nul_and_drive() {
        assert!(AssetPath::parse("..\\windows").is_err());
        assert!(AssetPath::parse("a\0b").is_err());
        assert!(AssetPath::parse("C:/boot.ini").is_err());
        assert!(AssetPath::parse("/d:relative.bin").is_err());
    }

    #[test]
    fn colons_outside_a_drive_prefix_are_fine() {
        assert_eq!(
            AssetPath::parse("audio/a:b.bin").unwrap().as_str(),
            "audio/a:b.bin"
        );
        assert!(AssetPath::parse("tracks:01.mp3").is_ok());
        assert!(AssetPath::parse("maps/C:").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(AssetPath::parse("").is_err());
        assert!(AssetPath::parse("/./").is_err());
    }

    #[test]
    fn rejects_temp_file_names() {
        assert!(AssetPath::parse("data/main.bin.3.vcpart").is_err());
    }

    #[test]
    fn extension_ignores_dotfiles() {
        assert_eq!(AssetPath::parse(".hidden").unwrap().extension(), None);
        assert_eq!(AssetPath::parse("noext").unwrap().extension(), None);
        assert_eq!(
            AssetPath::parse("Index.HTML").unwrap().extension().as_deref(),
            Some("html")
        );
    }

    #[test]
    fn namespace_names() {
        assert_eq!(Namespace::Vcsky.to_string(), "vcsky");
        assert_eq!(Namespace::Vcbr.as_str(), "vcbr");
    }
}
