//! Reading source documents from disk.

use std::path::Path;

use sc_core::{Error, Result};

/// Extensions read as plain UTF-8 text.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

/// Read a `.txt` or `.md` document.
///
/// Other formats are rejected with [`Error::Validation`]; text extraction
/// from PDF or DOCX is left to whatever produces the input.
pub fn read_document(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if !TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return Err(Error::Validation(format!(
            "unsupported document type '{}': expected one of {}",
            path.display(),
            TEXT_EXTENSIONS.join(", ")
        )));
    }

    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes)
        .map_err(|e| Error::Validation(format!("{} is not UTF-8: {e}", path.display())))
}
