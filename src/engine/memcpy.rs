//! Adaptive bulk copy
//!
//! Every copy on the batch assembly path goes through a strategy that is
//! bound lazily on first use and then kept for the life of the process.
//! The default strategy moves the cache-line-multiple prefix of a copy in
//! wide SIMD blocks (aligned or unaligned loads depending on the addresses)
//! and finishes the tail byte by byte.
//!
//! The binding can be overridden by name through `DLACLASSIFY_MEMCPY` or the
//! `[copy] strategy` config key:
//! - `fallback` (alias `libc`): plain slice copy
//! - `fast-aligned` (alias `sse2`): block copy + byte tail
//! - `checksummed` (alias `memcpy_s`): plain copy, verified by checksum

use std::fmt;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// Alignment boundary and block width of the fast path, one cache line
pub const BLOCK_ALIGN: usize = 64;

/// Environment variable naming an override strategy
pub const MEMCPY_ENV: &str = "DLACLASSIFY_MEMCPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyStrategy {
    Fallback,
    FastAligned,
    Checksummed,
}

impl CopyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStrategy::Fallback => "fallback",
            CopyStrategy::FastAligned => "fast-aligned",
            CopyStrategy::Checksummed => "checksummed",
        }
    }

    /// Copy `src` into `dst`; both slices have the same, non-zero length.
    fn copy(self, dst: &mut [u8], src: &[u8]) {
        match self {
            CopyStrategy::Fallback => dst.copy_from_slice(src),
            CopyStrategy::FastAligned => fast_copy(dst, src),
            CopyStrategy::Checksummed => {
                dst.copy_from_slice(src);
                assert_eq!(
                    checksum(dst),
                    checksum(src),
                    "checksummed copy of {} bytes produced a corrupted destination",
                    src.len()
                );
            }
        }
    }
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown copy strategy `{0}`")]
pub struct UnknownStrategy(pub String);

impl FromStr for CopyStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let known = [
            ("fallback", CopyStrategy::Fallback),
            ("libc", CopyStrategy::Fallback),
            ("fast-aligned", CopyStrategy::FastAligned),
            ("sse2", CopyStrategy::FastAligned),
            ("checksummed", CopyStrategy::Checksummed),
            ("memcpy_s", CopyStrategy::Checksummed),
        ];
        known
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|(_, strategy)| *strategy)
            .ok_or_else(|| UnknownStrategy(name.to_string()))
    }
}

/// Lazily bound copy routine.
///
/// The strategy is resolved on the first [`copy`](Self::copy) (or
/// [`strategy`](Self::strategy)) call and never changes afterwards. Concurrent
/// first callers all observe the same binding.
#[derive(Debug)]
pub struct BulkCopy {
    override_name: Option<String>,
    bound: OnceCell<CopyStrategy>,
}

impl BulkCopy {
    /// Create an unbound copier with an optional override name
    pub fn new(override_name: Option<String>) -> Self {
        Self {
            override_name,
            bound: OnceCell::new(),
        }
    }

    /// Create a copier already bound to `strategy`
    pub fn with_strategy(strategy: CopyStrategy) -> Self {
        Self {
            override_name: None,
            bound: OnceCell::with_value(strategy),
        }
    }

    /// Create an unbound copier reading its override from `DLACLASSIFY_MEMCPY`
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    /// Create an unbound copier whose override is `lookup(MEMCPY_ENV)`
    pub fn from_lookup(lookup: impl FnOnce(&str) -> Option<String>) -> Self {
        Self::new(lookup(MEMCPY_ENV))
    }

    pub fn is_bound(&self) -> bool {
        self.bound.get().is_some()
    }

    /// Strategy in effect, binding it if this is the first use
    pub fn strategy(&self) -> CopyStrategy {
        *self.bound.get_or_init(|| {
            let strategy = self.select();
            debug!("Bound bulk copy strategy: {}", strategy);
            strategy
        })
    }

    fn select(&self) -> CopyStrategy {
        match self.override_name.as_deref() {
            Some(name) => name.parse().unwrap_or_else(|err: UnknownStrategy| {
                warn!("Ignoring {}, using {}", err, CopyStrategy::FastAligned);
                CopyStrategy::FastAligned
            }),
            None => CopyStrategy::FastAligned,
        }
    }

    /// Copy `len` bytes from `src` into the front of `dst` and return `dst`.
    ///
    /// `dst.len()` is the destination capacity.
    ///
    /// # Panics
    ///
    /// If `len` exceeds `dst.len()` or `src.len()`. Callers size their
    /// copies up front; a short destination is a programming error.
    pub fn copy<'a>(&self, dst: &'a mut [u8], src: &[u8], len: usize) -> &'a mut [u8] {
        assert!(
            len <= dst.len(),
            "bulk copy of {} bytes overflows destination of {} bytes",
            len,
            dst.len()
        );
        assert!(
            len <= src.len(),
            "bulk copy of {} bytes overruns source of {} bytes",
            len,
            src.len()
        );
        if len == 0 {
            return dst;
        }

        self.strategy().copy(&mut dst[..len], &src[..len]);
        dst
    }
}

impl Default for BulkCopy {
    fn default() -> Self {
        Self::new(None)
    }
}

static GLOBAL: OnceCell<BulkCopy> = OnceCell::new();

/// Process-wide copier, created from the environment on first use
pub fn global() -> &'static BulkCopy {
    GLOBAL.get_or_init(BulkCopy::from_env)
}

/// Install the process-wide copier with an explicit override name.
///
/// Falls back to the environment when `override_name` is `None`. Returns
/// `false` if the global copier already exists, in which case the existing
/// binding is kept.
pub fn install(override_name: Option<String>) -> bool {
    install_into(&GLOBAL, override_name, env_lookup)
}

fn install_into(
    cell: &OnceCell<BulkCopy>,
    override_name: Option<String>,
    lookup: impl FnOnce(&str) -> Option<String>,
) -> bool {
    let copier = match override_name {
        Some(name) => BulkCopy::new(Some(name)),
        None => BulkCopy::from_lookup(lookup),
    };
    cell.set(copier).is_ok()
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Copy through the process-wide copier
pub fn copy<'a>(dst: &'a mut [u8], src: &[u8], len: usize) -> &'a mut [u8] {
    global().copy(dst, src, len)
}

fn is_block_aligned(ptr: *const u8) -> bool {
    (ptr as usize) % BLOCK_ALIGN == 0
}

fn fast_copy(dst: &mut [u8], src: &[u8]) {
    let bulk = dst.len() & !(BLOCK_ALIGN - 1);
    let (dst_blocks, dst_tail) = dst.split_at_mut(bulk);
    let (src_blocks, src_tail) = src.split_at(bulk);

    if bulk > 0 {
        if is_block_aligned(dst_blocks.as_ptr()) && is_block_aligned(src_blocks.as_ptr()) {
            trace!("copying {:#x} bytes with aligned blocks", bulk);
            block_copy_aligned(dst_blocks, src_blocks);
        } else {
            trace!("copying {:#x} bytes (unaligned) with blocks", bulk);
            block_copy_unaligned(dst_blocks, src_blocks);
        }
    }

    byte_copy(dst_tail, src_tail);
}

/// Tail copy, shorter than one block
fn byte_copy(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *s;
    }
}

#[cfg(target_arch = "x86_64")]
fn block_copy_aligned(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    debug_assert_eq!(dst.len() % BLOCK_ALIGN, 0);

    let blocks = dst.len() / BLOCK_ALIGN;
    // SAFETY: SSE2 is part of the x86_64 baseline. Both slices start on a
    // 64-byte boundary and span `blocks * 64` bytes, so every 16-byte lane
    // is in bounds and 16-byte aligned. The slices cannot overlap.
    unsafe {
        let mut s = src.as_ptr() as *const __m128i;
        let mut d = dst.as_mut_ptr() as *mut __m128i;
        for _ in 0..blocks {
            let a = _mm_load_si128(s);
            let b = _mm_load_si128(s.add(1));
            let c = _mm_load_si128(s.add(2));
            let e = _mm_load_si128(s.add(3));
            _mm_store_si128(d, a);
            _mm_store_si128(d.add(1), b);
            _mm_store_si128(d.add(2), c);
            _mm_store_si128(d.add(3), e);
            s = s.add(4);
            d = d.add(4);
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn block_copy_unaligned(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    debug_assert_eq!(dst.len() % BLOCK_ALIGN, 0);

    let blocks = dst.len() / BLOCK_ALIGN;
    // SAFETY: as above, minus the alignment requirement, which the
    // loadu/storeu forms do not have.
    unsafe {
        let mut s = src.as_ptr() as *const __m128i;
        let mut d = dst.as_mut_ptr() as *mut __m128i;
        for _ in 0..blocks {
            let a = _mm_loadu_si128(s);
            let b = _mm_loadu_si128(s.add(1));
            let c = _mm_loadu_si128(s.add(2));
            let e = _mm_loadu_si128(s.add(3));
            _mm_storeu_si128(d, a);
            _mm_storeu_si128(d.add(1), b);
            _mm_storeu_si128(d.add(2), c);
            _mm_storeu_si128(d.add(3), e);
            s = s.add(4);
            d = d.add(4);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn block_copy_aligned(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst
        .chunks_exact_mut(BLOCK_ALIGN)
        .zip(src.chunks_exact(BLOCK_ALIGN))
    {
        d.copy_from_slice(s);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn block_copy_unaligned(dst: &mut [u8], src: &[u8]) {
    block_copy_aligned(dst, src)
}

fn checksum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| {
            acc.wrapping_mul(31).wrapping_add(b as u64 ^ (i as u64 & 0xff))
        })
}
