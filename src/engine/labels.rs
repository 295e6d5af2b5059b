//! Class label files
//!
//! One label per line, surrounding whitespace trimmed. A model `alexnet.xml`
//! looks for `alexnet.labels` next to it unless a path is configured.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;

/// Default label file for a model: same stem, `.labels` extension
pub fn default_label_path(model: &Path) -> PathBuf {
    model.with_extension("labels")
}

/// Read labels from `path`; a missing file yields an empty list
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("No label file at {}, using class ids", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let labels: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
    info!("Loaded {} labels from {}", labels.len(), path.display());
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_labels_are_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "  tabby cat \n\tgolden retriever\r\nstop sign").unwrap();

        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["tabby cat", "golden retriever", "stop sign"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let labels = load_labels(&dir.path().join("absent.labels")).unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn test_default_label_path() {
        assert_eq!(
            default_label_path(Path::new("models/alexnet.xml")),
            PathBuf::from("models/alexnet.labels")
        );
    }
}
