//! Output decoding into ranked per-image classes

use std::fmt;

use crate::error::{PipelineError, Result};
use crate::utils::math::top_k_indices;

/// `batch × num_classes` f32 scores, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    data: Vec<f32>,
    batch_size: usize,
    num_classes: usize,
}

impl OutputTensor {
    pub fn new(data: Vec<f32>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::configuration("output batch size is 0"));
        }
        if data.len() % batch_size != 0 {
            return Err(PipelineError::configuration(format!(
                "output of {} scores does not split into {} rows",
                data.len(),
                batch_size
            )));
        }
        let num_classes = data.len() / batch_size;
        Ok(Self {
            data,
            batch_size,
            num_classes,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.num_classes..(index + 1) * self.num_classes]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
    pub class_id: usize,
    pub label: String,
    pub score: f32,
}

/// Ranked classes for one batch item, best first
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassificationResult {
    pub classes: Vec<ClassScore>,
}

impl ClassificationResult {
    pub fn top(&self) -> Option<&ClassScore> {
        self.classes.first()
    }

    pub fn class_ids(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.class_id).collect()
    }
}

impl fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>8}  {:>11}  label", "classid", "probability")?;
        for class in &self.classes {
            writeln!(f, "{:>8}  {:>11.7}  {}", class.class_id, class.score, class.label)?;
        }
        Ok(())
    }
}

/// Label for `class_id`, or `#<class_id>` when the label list is short
pub fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("#{}", class_id))
}

/// Rank each output row.
///
/// Results follow batch order. `top_k` larger than the class count is
/// clamped; `top_k == 0` is rejected.
pub fn decode(
    output: &OutputTensor,
    batch_size: usize,
    top_k: usize,
    labels: &[String],
) -> Result<Vec<ClassificationResult>> {
    if top_k == 0 {
        return Err(PipelineError::configuration("top_k must be at least 1"));
    }
    if batch_size != output.batch_size() {
        return Err(PipelineError::configuration(format!(
            "output has {} rows, batch has {} images",
            output.batch_size(),
            batch_size
        )));
    }

    let results = (0..batch_size)
        .map(|i| {
            let row = output.row(i);
            let classes = top_k_indices(row, top_k)
                .into_iter()
                .map(|class_id| ClassScore {
                    class_id,
                    label: label_for(labels, class_id),
                    score: row[class_id],
                })
                .collect();
            ClassificationResult { classes }
        })
        .collect();

    Ok(results)
}
