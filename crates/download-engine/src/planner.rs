//! Chunk sizing policy: maps a probed content length to a chunk count and
//! per-chunk byte width, and computes the inclusive range for each chunk.

use crate::progress::{GB, MB, TB};

/// Compute how many chunks to split `total_bytes` into, capped by the
/// caller's `max_chunks`.
///
/// Sizes of at least a terabyte, gigabyte, or megabyte select a base of
/// 1000, 100, or 10 respectively, divided by three; anything smaller is a
/// single chunk. Returns 0 for an empty resource, which the engine treats
/// as a cancel.
pub(crate) fn plan_chunks(total_bytes: u64, max_chunks: u64) -> u64 {
    if total_bytes == 0 {
        return 0;
    }
    let base: u64 = if total_bytes >= TB {
        1000
    } else if total_bytes >= GB {
        100
    } else if total_bytes >= MB {
        10
    } else {
        return 1;
    };
    (base / 3).min(max_chunks)
}

/// Inclusive byte range for 1-based chunk `k` of `chunk_count`.
///
/// Chunk 1 starts at zero; later chunks start one past the previous
/// chunk's end. The final chunk's end is pinned to `total_bytes` so the
/// last request captures the remainder lost to integer division.
pub(crate) fn chunk_range(
    k: u64,
    chunk_count: u64,
    bytes_per_chunk: u64,
    total_bytes: u64,
) -> (u64, u64) {
    let start = if k == 1 {
        0
    } else {
        (k - 1) * bytes_per_chunk + 1
    };
    let end = if k == chunk_count {
        total_bytes
    } else {
        (k * bytes_per_chunk).min(total_bytes)
    };
    (start, end)
}
