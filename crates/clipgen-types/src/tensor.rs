//! Dense row-major `f32` tensor.
//!
//! This is the unit of exchange between ranks and between the pipeline and
//! its model collaborators. It is intentionally small: contiguous storage,
//! a shape vector, and the handful of axis operations the decode path needs
//! (narrow, concatenate, pad, split).

use serde::{Deserialize, Serialize};

use crate::error::TensorError;

type Result<T> = std::result::Result<T, TensorError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Self { shape: shape.to_vec(), data: vec![0.0; n] }
    }

    /// Wrap existing storage. Fails when `data.len()` disagrees with `shape`.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape: shape.to_vec(),
                actual: data.len(),
            });
        }
        Ok(Self { shape: shape.to_vec(), data })
    }

    /// Build a tensor by evaluating `f` at every flat index.
    pub fn from_fn(shape: &[usize], f: impl FnMut(usize) -> f32) -> Self {
        let n: usize = shape.iter().product();
        Self { shape: shape.to_vec(), data: (0..n).map(f).collect() }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Length of `axis`.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.shape
            .get(axis)
            .copied()
            .ok_or(TensorError::AxisOutOfRange { axis, rank: self.rank() })
    }

    /// Destructure a 5-d `(B, C, T, H, W)` shape.
    pub fn dims5(&self) -> Result<(usize, usize, usize, usize, usize)> {
        match self.shape[..] {
            [b, c, t, h, w] => Ok((b, c, t, h, w)),
            _ => Err(TensorError::Rank { expected: 5, shape: self.shape.clone() }),
        }
    }

    /// Reinterpret the storage under a new shape with the same element count.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        Self::from_vec(shape, self.data)
    }

    /// Apply `f` to every element in place.
    pub fn map_inplace(&mut self, f: impl Fn(f32) -> f32) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    /// Largest absolute element-wise difference. Shapes must match.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch(format!(
                "{:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }

    // ── Axis operations ──────────────────────────────────────────────────

    /// `(outer, axis_len, inner)` such that the flat layout is
    /// `outer × axis_len × inner`.
    fn split_at_axis(&self, axis: usize) -> Result<(usize, usize, usize)> {
        let len = self.dim(axis)?;
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        Ok((outer, len, inner))
    }

    /// Copy of `len` entries along `axis` starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let (outer, axis_len, inner) = self.split_at_axis(axis)?;
        let end = start + len;
        if end > axis_len {
            return Err(TensorError::NarrowOutOfRange { start, end, len: axis_len });
        }

        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * axis_len * inner;
            data.extend_from_slice(&self.data[base + start * inner..base + end * inner]);
        }

        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Tensor { shape, data })
    }

    /// Concatenate along `axis`. All other dimensions must agree.
    pub fn cat(parts: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::ShapeMismatch("cannot concatenate zero tensors".into()))?;
        let (outer, _, inner) = first.split_at_axis(axis)?;

        for p in parts {
            let same_rank = p.rank() == first.rank();
            let same_other = same_rank
                && p.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !same_other {
                return Err(TensorError::ShapeMismatch(format!(
                    "cat along axis {axis}: {:?} vs {:?}",
                    p.shape, first.shape
                )));
            }
        }

        let total: usize = parts.iter().map(|p| p.shape[axis]).sum();
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for p in parts {
                let chunk = p.shape[axis] * inner;
                data.extend_from_slice(&p.data[o * chunk..(o + 1) * chunk]);
            }
        }

        let mut shape = first.shape.clone();
        shape[axis] = total;
        Ok(Tensor { shape, data })
    }

    /// Zero-pad the end of `axis` up to `target` entries. A tensor already at
    /// or beyond `target` is returned unchanged.
    pub fn pad_axis_end(&self, axis: usize, target: usize) -> Result<Tensor> {
        let len = self.dim(axis)?;
        if len >= target {
            return Ok(self.clone());
        }
        let mut pad_shape = self.shape.clone();
        pad_shape[axis] = target - len;
        Tensor::cat(&[self.clone(), Tensor::zeros(&pad_shape)], axis)
    }

    /// Split into `parts` contiguous chunks along `axis`. The first
    /// `len % parts` chunks carry one extra entry, so chunk sizes differ by at
    /// most one. Chunks may be empty when `parts > len`.
    pub fn split_even(&self, axis: usize, parts: usize) -> Result<Vec<Tensor>> {
        if parts == 0 {
            return Err(TensorError::ShapeMismatch("split into zero parts".into()));
        }
        let len = self.dim(axis)?;
        let mut out = Vec::with_capacity(parts);
        let mut start = 0;
        for size in split_sizes(len, parts) {
            out.push(self.narrow(axis, start, size)?);
            start += size;
        }
        Ok(out)
    }
}

/// Chunk lengths produced by [`Tensor::split_even`].
pub fn split_sizes(len: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = len / parts;
    let extra = len % parts;
    (0..parts).map(|i| base + usize::from(i < extra)).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: &[usize]) -> Tensor {
        Tensor::from_fn(shape, |i| i as f32)
    }

    #[test]
    fn from_vec_checks_count() {
        assert!(Tensor::from_vec(&[2, 3], vec![0.0; 6]).is_ok());
        let err = Tensor::from_vec(&[2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, TensorError::ElementCount { actual: 5, .. }));
    }

    #[test]
    fn narrow_middle_axis() {
        let t = iota(&[2, 3, 2]);
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2, 2]);
        assert_eq!(n.data(), &[2.0, 3.0, 4.0, 5.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn narrow_out_of_range() {
        let t = iota(&[4]);
        assert!(t.narrow(0, 3, 2).is_err());
    }

    #[test]
    fn cat_inverts_narrow() {
        let t = iota(&[1, 2, 5, 3, 3]);
        let a = t.narrow(2, 0, 2).unwrap();
        let b = t.narrow(2, 2, 3).unwrap();
        assert_eq!(Tensor::cat(&[a, b], 2).unwrap(), t);
    }

    #[test]
    fn cat_rejects_mismatched_shapes() {
        let a = Tensor::zeros(&[2, 3]);
        let b = Tensor::zeros(&[3, 3]);
        assert!(Tensor::cat(&[a, b], 1).is_err());
    }

    #[test]
    fn pad_then_narrow_recovers() {
        let t = iota(&[1, 1, 3, 2, 2]);
        let padded = t.pad_axis_end(2, 5).unwrap();
        assert_eq!(padded.shape(), &[1, 1, 5, 2, 2]);
        assert!(padded.data()[12..].iter().all(|&v| v == 0.0));
        assert_eq!(padded.narrow(2, 0, 3).unwrap(), t);
    }

    #[test]
    fn split_sizes_match_tensor_split() {
        assert_eq!(split_sizes(17, 3), vec![6, 6, 5]);
        assert_eq!(split_sizes(4, 4), vec![1, 1, 1, 1]);
        assert_eq!(split_sizes(2, 3), vec![1, 1, 0]);
    }

    #[test]
    fn split_even_covers_axis() {
        let t = iota(&[1, 1, 7, 1, 1]);
        let parts = t.split_even(2, 3).unwrap();
        let lens: Vec<usize> = parts.iter().map(|p| p.shape()[2]).collect();
        assert_eq!(lens, vec![3, 2, 2]);
        assert_eq!(Tensor::cat(&parts, 2).unwrap(), t);
    }

    proptest::proptest! {
        #[test]
        fn split_even_then_cat_is_identity(len in 0usize..40, parts in 1usize..8, inner in 1usize..4) {
            let t = iota(&[2, len, inner]);
            let chunks = t.split_even(1, parts).unwrap();
            proptest::prop_assert_eq!(chunks.len(), parts);
            let sizes: Vec<usize> = chunks.iter().map(|c| c.shape()[1]).collect();
            proptest::prop_assert_eq!(&sizes, &split_sizes(len, parts));
            proptest::prop_assert!(sizes.windows(2).all(|w| w[0] >= w[1] && w[0] - w[1] <= 1));
            proptest::prop_assert_eq!(Tensor::cat(&chunks, 1).unwrap(), t);
        }
    }

    #[test]
    fn dims5_rejects_other_ranks() {
        assert!(Tensor::zeros(&[1, 2, 3]).dims5().is_err());
        assert_eq!(Tensor::zeros(&[1, 2, 3, 4, 5]).dims5().unwrap(), (1, 2, 3, 4, 5));
    }

    #[test]
    fn serde_round_trip() {
        let t = iota(&[2, 2]);
        let json = serde_json::to_string(&t).unwrap();
        let round: Tensor = serde_json::from_str(&json).unwrap();
        assert_eq!(round, t);
    }
}
