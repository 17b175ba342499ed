use base64::{Engine, engine::general_purpose::STANDARD};

use crate::ProtocolError;

/// Encode document text so it survives the JSON text envelope unchanged.
///
/// The UTF-8 bytes are base64 encoded, so control characters and
/// non-ASCII text round-trip losslessly.
pub fn encode_content(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Inverse of [`encode_content`].
pub fn decode_content(encoded: &str) -> Result<String, ProtocolError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(String::from_utf8(bytes)?)
}

/// A document location in the form the backend addresses files:
/// a directory relative to the project root plus a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPath {
    pub dir: String,
    pub name: String,
}

impl DocumentPath {
    /// Split an absolute tree path into `(dir, name)` relative to `root`.
    ///
    /// A single leading `/` left after stripping the root is dropped. Paths
    /// outside `root` are split as given.
    pub fn split(path: &str, root: Option<&str>) -> Self {
        let relative = match root {
            Some(root) if !root.is_empty() => strip_root(path, root.trim_end_matches('/')),
            _ => path,
        };
        let relative = relative.strip_prefix('/').unwrap_or(relative);

        match relative.rsplit_once('/') {
            Some((dir, name)) => Self {
                dir: dir.to_string(),
                name: name.to_string(),
            },
            None => Self {
                dir: String::new(),
                name: relative.to_string(),
            },
        }
    }
}

/// `path` relative to `root`, or `path` itself when it is not inside `root`.
fn strip_root<'a>(path: &'a str, root: &str) -> &'a str {
    match path.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}
