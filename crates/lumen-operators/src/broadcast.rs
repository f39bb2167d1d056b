//! NumPy-style broadcasting for binary kernels.

use lumen_core::{Error, Result};

/// Compute the broadcast output shape of two input shapes.
///
/// Shapes are aligned from the rightmost dimension. Dimensions match if
/// they are equal or one of them is 1, and missing leading dimensions count
/// as 1.
///
/// ```text
/// broadcast_shape(&[2, 3, 4], &[3, 4])       -> [2, 3, 4]
/// broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]) -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let a = padded(a, rank);
    let b = padded(b, rank);

    a.iter()
        .zip(&b)
        .enumerate()
        .map(|(i, (&da, &db))| match (da, db) {
            _ if da == db => Ok(da),
            (1, _) => Ok(db),
            (_, 1) => Ok(da),
            _ => Err(Error::Precondition(format!(
                "cannot broadcast shapes {a:?} and {b:?} at dimension {i}"
            ))),
        })
        .collect()
}

/// `shape` with leading 1s up to `rank` dimensions.
pub fn padded(shape: &[usize], rank: usize) -> Vec<usize> {
    let mut out = vec![1; rank.saturating_sub(shape.len())];
    out.extend_from_slice(shape);
    out
}

/// Row-major element strides of `shape` broadcast to `out`, with 0 for
/// every broadcast dimension.
pub fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let shape = padded(shape, out.len());
    let mut strides = vec![0; out.len()];
    let mut stride = 1;
    for d in (0..out.len()).rev() {
        if shape[d] != 1 {
            strides[d] = stride;
        }
        stride *= shape[d];
    }
    strides
}

/// Whether `shape` repeats contiguously when flattened into `out`.
///
/// True when, after its leading 1s, `shape` equals the trailing dimensions
/// of `out`: element `i` of the output then reads element `i % len` of the
/// input.
pub fn is_suffix_broadcast(shape: &[usize], out: &[usize]) -> bool {
    let shape = padded(shape, out.len());
    let first = shape.iter().position(|&d| d != 1).unwrap_or(shape.len());
    shape[first..] == out[first..]
}
