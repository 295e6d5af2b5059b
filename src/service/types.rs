//! Service layer types

use std::fmt;
use std::path::PathBuf;

use crate::engine::ClassificationResult;

/// Ranked classes attributed to the image they were computed from
#[derive(Debug, Clone, PartialEq)]
pub struct ImageClassification {
    pub image: PathBuf,
    pub ranked: ClassificationResult,
}

impl fmt::Display for ImageClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image {}", self.image.display())?;
        write!(f, "{}", self.ranked)
    }
}
