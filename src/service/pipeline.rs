//! Classification pipeline - core orchestration
//!
//! Decodes images, assembles them into one batch, runs the asynchronous
//! scheduler against the model and attributes ranked results back to the
//! image paths they came from.

use std::path::PathBuf;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};

use super::types::ImageClassification;
use crate::engine::backend::Model;
use crate::engine::batch::BatchTensor;
use crate::engine::decode::decode;
use crate::engine::preprocess::{to_plane_major, PlaneMajorBuffer, RawImage};
use crate::engine::scheduler::InferenceScheduler;
use crate::error::{PipelineError, Result};
use crate::utils::image::{DecodeError, FileDecoder, ImageDecoder};

pub struct ClassificationPipeline<D: ImageDecoder = FileDecoder> {
    decoder: D,
    scheduler: InferenceScheduler,
    labels: Vec<String>,
}

impl<D: ImageDecoder> ClassificationPipeline<D> {
    pub fn new(decoder: D, iterations: usize, labels: Vec<String>) -> Self {
        Self {
            decoder,
            scheduler: InferenceScheduler::new(iterations),
            labels,
        }
    }

    /// Classify `image_paths` with `model`, keeping the `top_k` best classes.
    ///
    /// Unreadable images are skipped with a warning. Results come back in the
    /// order of the readable paths.
    pub fn run(
        &self,
        image_paths: &[PathBuf],
        model: &dyn Model,
        top_k: usize,
    ) -> Result<Vec<ImageClassification>> {
        // Everything that can be checked synchronously fails before submission
        if top_k == 0 {
            return Err(PipelineError::configuration("top_k must be at least 1"));
        }
        if model.num_inputs() != 1 {
            return Err(PipelineError::configuration(format!(
                "only models with 1 input are supported, model has {}",
                model.num_inputs()
            )));
        }
        if model.num_outputs() != 1 {
            return Err(PipelineError::configuration(format!(
                "only models with 1 output are supported, model has {}",
                model.num_outputs()
            )));
        }

        let shape = model.input_shape();
        info!(
            "Read input images ({}x{}, {} channels)",
            shape.width, shape.height, shape.channels
        );
        let (images, valid_paths) =
            self.read_images(image_paths, shape.width, shape.height, shape.channels)?;

        let planes: Vec<PlaneMajorBuffer> = images
            .par_iter()
            .map(|img| to_plane_major(img, shape.width, shape.height, shape.channels))
            .collect::<Result<_>>()?;
        let batch = BatchTensor::assemble(&planes)?;
        info!("Set batch size {}", batch.batch_size());

        let compiled = model.compile(batch.batch_size())?;
        let request = compiled.create_infer_request()?;

        let start = Instant::now();
        let (output, stats) = self.scheduler.run_with_stats(request, &batch)?;
        info!(
            "{} iterations in {:.2?} ({:.2?} per iteration, {:.1} images/s)",
            stats.iterations,
            start.elapsed(),
            stats.average_latency(),
            stats.throughput(batch.batch_size())
        );

        let results = decode(&output, batch.batch_size(), top_k, &self.labels)?;
        Ok(valid_paths
            .into_iter()
            .zip(results)
            .map(|(image, ranked)| ImageClassification { image, ranked })
            .collect())
    }

    fn read_images(
        &self,
        image_paths: &[PathBuf],
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<(Vec<RawImage>, Vec<PathBuf>)> {
        let mut images = Vec::with_capacity(image_paths.len());
        let mut valid_paths = Vec::with_capacity(image_paths.len());

        for path in image_paths {
            match self.decoder.decode(path, width, height, channels) {
                Ok(image) => {
                    images.push(image);
                    valid_paths.push(path.clone());
                }
                Err(err @ DecodeError::Unreadable { .. }) => {
                    warn!("{}, skipping", err);
                }
                Err(DecodeError::Fatal(reason)) => {
                    return Err(PipelineError::input(format!(
                        "{}: {}",
                        path.display(),
                        reason
                    )));
                }
            }
        }

        if images.is_empty() {
            return Err(PipelineError::input("Valid input images were not found"));
        }
        Ok((images, valid_paths))
    }
}
