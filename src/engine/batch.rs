//! Batch tensor assembly
//!
//! Concatenates plane-major image buffers into one contiguous NCHW tensor.
//! Row `i` of the batch is always input buffer `i`; results are attributed
//! back to source images through that order.

use tracing::debug;

use super::memcpy::{self, BulkCopy};
use super::preprocess::{sample_count, PlaneMajorBuffer};
use crate::error::{PipelineError, Result};

/// Contiguous `batch × C × H × W` u8 tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTensor {
    data: Vec<u8>,
    batch_size: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl BatchTensor {
    /// Assemble `buffers` into a freshly allocated tensor
    pub fn assemble(buffers: &[PlaneMajorBuffer]) -> Result<Self> {
        Self::assemble_with(buffers, memcpy::global())
    }

    /// Assemble with an explicit copier
    pub fn assemble_with(buffers: &[PlaneMajorBuffer], copier: &BulkCopy) -> Result<Self> {
        let (channels, height, width) = validate(buffers)?;
        let mut data = vec![0u8; batch_bytes(buffers.len(), width, height, channels)?];
        assemble_with(buffers, &mut data, copier)?;

        Ok(Self {
            data,
            batch_size: buffers.len(),
            channels,
            height,
            width,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Bytes per batch item
    pub fn item_size(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// `[N, C, H, W]`
    pub fn shape(&self) -> [usize; 4] {
        [self.batch_size, self.channels, self.height, self.width]
    }

    pub fn item(&self, index: usize) -> &[u8] {
        let size = self.item_size();
        &self.data[index * size..(index + 1) * size]
    }
}

/// Write `buffers` into `target` back to back through the process-wide copier
pub fn assemble(buffers: &[PlaneMajorBuffer], target: &mut [u8]) -> Result<()> {
    assemble_with(buffers, target, memcpy::global())
}

/// Write buffer `i` at offset `i * S`, where `S` is the shared buffer size.
///
/// Every size check happens before the first copy.
pub fn assemble_with(
    buffers: &[PlaneMajorBuffer],
    target: &mut [u8],
    copier: &BulkCopy,
) -> Result<()> {
    let (channels, height, width) = validate(buffers)?;
    let item_size = sample_count(width, height, channels)?;
    let needed = batch_bytes(buffers.len(), width, height, channels)?;
    if target.len() < needed {
        return Err(PipelineError::configuration(format!(
            "batch target holds {} bytes, {} images of {} bytes need {}",
            target.len(),
            buffers.len(),
            item_size,
            needed
        )));
    }

    for (i, buffer) in buffers.iter().enumerate() {
        copier.copy(&mut target[i * item_size..], buffer.as_bytes(), item_size);
    }

    debug!(
        "Assembled {} images of {} bytes with {} copy",
        buffers.len(),
        item_size,
        copier.strategy()
    );
    Ok(())
}

/// Bytes of a batch of `count` items, rejecting overflow
fn batch_bytes(count: usize, width: usize, height: usize, channels: usize) -> Result<usize> {
    sample_count(width, height, channels)?
        .checked_mul(count)
        .ok_or_else(|| {
            PipelineError::configuration(format!(
                "batch of {} images of {}x{}x{} overflows",
                count, width, height, channels
            ))
        })
}

fn validate(buffers: &[PlaneMajorBuffer]) -> Result<(usize, usize, usize)> {
    let first = buffers
        .first()
        .ok_or_else(|| PipelineError::input("cannot assemble an empty batch"))?;
    let dims = first.dims();

    if let Some((i, other)) = buffers
        .iter()
        .enumerate()
        .find(|(_, b)| b.dims() != dims)
    {
        return Err(PipelineError::configuration(format!(
            "batch item {} is {:?} (CHW), item 0 is {:?}",
            i,
            other.dims(),
            dims
        )));
    }

    Ok(dims)
}
