//! Static tuning table for the blocked kernels.
//!
//! Entries are scanned in order and the first one whose bounds admit the key
//! wins. The table is immutable; there is no run-time autotuning or cache.

use candle_core::DType;

use super::KernelKey;

/// Block sizes used by [`StreamingKernels`](super::StreamingKernels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningParams {
    /// Keys per streaming attention step.
    pub key_block: usize,
    /// Chunk positions per chunk-state contraction.
    pub time_block: usize,
    /// Chunk positions per query-state contraction.
    pub query_block: usize,
    /// Whether `Auto` selection should prefer the blocked kernels.
    pub prefer_streaming: bool,
}

#[derive(Debug)]
struct TuningEntry {
    max_head_dim: usize,
    max_deg: usize,
    min_chunk_len: usize,
    reduced_precision: Option<bool>,
    params: TuningParams,
}

const fn entry(
    max_head_dim: usize,
    max_deg: usize,
    min_chunk_len: usize,
    reduced_precision: Option<bool>,
    key_block: usize,
    time_block: usize,
    query_block: usize,
    prefer_streaming: bool,
) -> TuningEntry {
    TuningEntry {
        max_head_dim,
        max_deg,
        min_chunk_len,
        reduced_precision,
        params: TuningParams {
            key_block,
            time_block,
            query_block,
            prefer_streaming,
        },
    }
}

/// Ordered from most to least specific.
static TUNING_TABLE: &[TuningEntry] = &[
    entry(32, 2, 64, None, 64, 64, 64, true),
    entry(64, 2, 128, Some(true), 64, 64, 32, true),
    entry(64, 2, 128, Some(false), 128, 64, 64, true),
    // Large expansions: keep the expanded key/query buffers narrow.
    entry(usize::MAX, usize::MAX, 128, None, 64, 16, 16, true),
];

const FALLBACK: TuningParams = TuningParams {
    key_block: 64,
    time_block: 32,
    query_block: 32,
    prefer_streaming: false,
};

fn admits(entry: &TuningEntry, key: &KernelKey) -> bool {
    let reduced = matches!(key.dtype, DType::F16 | DType::BF16);
    key.head_dim <= entry.max_head_dim
        && key.deg <= entry.max_deg
        && key.chunk_len >= entry.min_chunk_len
        && entry.reduced_precision.map_or(true, |want| want == reduced)
}

/// Resolve block sizes for `key`.
pub fn lookup(key: &KernelKey) -> TuningParams {
    // Chunks no longer than one key block gain nothing from streaming.
    if key.chunk_len <= FALLBACK.key_block {
        return TuningParams {
            prefer_streaming: false,
            ..FALLBACK
        };
    }
    TUNING_TABLE
        .iter()
        .find(|entry| admits(entry, key))
        .map(|entry| entry.params)
        .unwrap_or(FALLBACK)
}
