//! Token pack / unpack.
//!
//! Joint attention runs over the visual tokens `X[B, N, H, D]` and the text
//! tokens `Y[B, L, H, D]` of every batch element at once, but only over the
//! valid positions. `pack` gathers those positions into one dense buffer;
//! `unpack` scatters the attention output back.
//!
//! Each packed row `t` is addressed by `indices[t]` into the virtual
//! concatenation `[X | Y]` of shape `B × (N + L)`:
//!
//! ```text
//!   b   = idx / (N + L)
//!   pos = idx % (N + L)
//!   pos <  N  →  X[b, pos]
//!   pos >= N  →  Y[b, pos - N]
//! ```
//!
//! Two kernels share that decoding. [`PackKernel::Reference`] materializes
//! the concatenation and index-selects from it; [`PackKernel::Parallel`]
//! copies rows straight between the sources and the packed buffer on the
//! rayon pool. The kernel is chosen once with [`PackKernel::select`].

use rayon::prelude::*;
use tracing::{info, warn};

use clipgen_types::config::PackKernelChoice;
use clipgen_types::Tensor;

use crate::error::{OpsError, Result};

/// Shape facts shared by pack and unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PackDims {
    b: usize,
    n: usize,
    l: usize,
    heads: usize,
    head_dim: usize,
}

impl PackDims {
    fn span(&self) -> usize {
        self.n + self.l
    }

    fn row(&self) -> usize {
        self.heads * self.head_dim
    }

    /// Which source a flat index reads from, and the flat row inside it.
    fn locate(&self, idx: usize) -> Source {
        let b = idx / self.span();
        let pos = idx % self.span();
        if pos < self.n {
            Source::X(b * self.n + pos)
        } else {
            Source::Y(b * self.l + pos - self.n)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    X(usize),
    Y(usize),
}

fn dims4(t: &Tensor, name: &str) -> Result<[usize; 4]> {
    match *t.shape() {
        [a, b, c, d] => Ok([a, b, c, d]),
        ref other => Err(OpsError::ContractViolation(format!(
            "{name} must be 4-d [B, tokens, heads, head_dim], got {other:?}"
        ))),
    }
}

/// Check every index against `B * (N + L)` and convert to `usize`.
fn checked_indices(indices: &[i64], dims: &PackDims) -> Result<Vec<usize>> {
    let limit = dims.b * dims.span();
    indices
        .iter()
        .enumerate()
        .map(|(t, &idx)| match usize::try_from(idx) {
            Ok(i) if i < limit => Ok(i),
            _ => Err(OpsError::ContractViolation(format!(
                "index {idx} at position {t} outside [0, {limit})"
            ))),
        })
        .collect()
}

// ── Kernel selection ──────────────────────────────────────────────────────────

/// A pack/unpack implementation, resolved once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKernel {
    Reference,
    Parallel,
}

impl PackKernel {
    /// Resolve the configured choice against what the host can do.
    /// `Parallel` needs more than one worker thread to be worth it.
    pub fn select(choice: PackKernelChoice) -> Self {
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let kernel = match choice {
            PackKernelChoice::Reference => Self::Reference,
            PackKernelChoice::Parallel | PackKernelChoice::Auto if threads > 1 => Self::Parallel,
            PackKernelChoice::Parallel => {
                warn!(threads, "parallel pack kernel requested on a single-threaded host, using reference");
                Self::Reference
            }
            PackKernelChoice::Auto => Self::Reference,
        };
        info!(?choice, ?kernel, threads, "pack kernel selected");
        kernel
    }

    /// `X[B,N,H,D]`, `Y[B,L,H,D]`, `indices[T]` → `packed[T,H,D]`.
    pub fn pack(&self, x: &Tensor, y: &Tensor, indices: &[i64]) -> Result<Tensor> {
        let [b, n, heads, head_dim] = dims4(x, "X")?;
        let [yb, l, yh, yd] = dims4(y, "Y")?;
        if (yb, yh, yd) != (b, heads, head_dim) {
            return Err(OpsError::ContractViolation(format!(
                "Y shape {:?} incompatible with X shape {:?}",
                y.shape(),
                x.shape()
            )));
        }
        let dims = PackDims { b, n, l, heads, head_dim };
        let idx = checked_indices(indices, &dims)?;

        match self {
            Self::Reference => pack_reference(x, y, &idx, &dims),
            Self::Parallel => pack_parallel(x, y, &idx, &dims),
        }
    }

    /// `packed[T,H,D]`, `indices[T]` → `(X'[B,N,H,D], Y'[B,L,H,D])`.
    /// Positions no index names stay zero.
    pub fn unpack(
        &self,
        packed: &Tensor,
        indices: &[i64],
        b: usize,
        n: usize,
        l: usize,
    ) -> Result<(Tensor, Tensor)> {
        let (t, heads, head_dim) = match *packed.shape() {
            [t, h, d] => (t, h, d),
            ref other => {
                return Err(OpsError::ContractViolation(format!(
                    "packed buffer must be 3-d [T, heads, head_dim], got {other:?}"
                )))
            }
        };
        if t != indices.len() {
            return Err(OpsError::ContractViolation(format!(
                "packed buffer has {t} rows but {} indices were given",
                indices.len()
            )));
        }
        let dims = PackDims { b, n, l, heads, head_dim };
        let idx = checked_indices(indices, &dims)?;

        match self {
            Self::Reference => unpack_reference(packed, &idx, &dims),
            Self::Parallel => unpack_parallel(packed, &idx, &dims),
        }
    }
}

// ── Reference kernel ──────────────────────────────────────────────────────────

fn pack_reference(x: &Tensor, y: &Tensor, idx: &[usize], dims: &PackDims) -> Result<Tensor> {
    let row = dims.row();
    let joined = Tensor::cat(&[x.clone(), y.clone()], 1)?;
    let src = joined.data();

    let mut out = Vec::with_capacity(idx.len() * row);
    for &i in idx {
        out.extend_from_slice(&src[i * row..(i + 1) * row]);
    }
    Ok(Tensor::from_vec(&[idx.len(), dims.heads, dims.head_dim], out)?)
}

fn unpack_reference(packed: &Tensor, idx: &[usize], dims: &PackDims) -> Result<(Tensor, Tensor)> {
    let row = dims.row();
    let mut full = Tensor::zeros(&[dims.b, dims.span(), dims.heads, dims.head_dim]);
    let src = packed.data();
    let dst = full.data_mut();
    for (t, &i) in idx.iter().enumerate() {
        dst[i * row..(i + 1) * row].copy_from_slice(&src[t * row..(t + 1) * row]);
    }
    Ok((full.narrow(1, 0, dims.n)?, full.narrow(1, dims.n, dims.l)?))
}

// ── Parallel kernel ───────────────────────────────────────────────────────────

fn pack_parallel(x: &Tensor, y: &Tensor, idx: &[usize], dims: &PackDims) -> Result<Tensor> {
    let row = dims.row();
    let shape = [idx.len(), dims.heads, dims.head_dim];
    if row == 0 {
        return Ok(Tensor::zeros(&shape));
    }

    let (xs, ys) = (x.data(), y.data());
    let mut out = vec![0.0f32; idx.len() * row];
    out.par_chunks_mut(row).zip(idx.par_iter()).for_each(|(dst, &i)| {
        let src = match dims.locate(i) {
            Source::X(r) => &xs[r * row..(r + 1) * row],
            Source::Y(r) => &ys[r * row..(r + 1) * row],
        };
        dst.copy_from_slice(src);
    });
    Ok(Tensor::from_vec(&shape, out)?)
}

fn unpack_parallel(packed: &Tensor, idx: &[usize], dims: &PackDims) -> Result<(Tensor, Tensor)> {
    let row = dims.row();
    let mut x = Tensor::zeros(&[dims.b, dims.n, dims.heads, dims.head_dim]);
    let mut y = Tensor::zeros(&[dims.b, dims.l, dims.heads, dims.head_dim]);
    if row == 0 {
        return Ok((x, y));
    }

    // Invert the index list so every destination row pulls from at most one
    // packed row. With duplicate indices the last occurrence wins, matching
    // the sequential scatter of the reference kernel.
    let mut x_src = vec![None; dims.b * dims.n];
    let mut y_src = vec![None; dims.b * dims.l];
    for (t, &i) in idx.iter().enumerate() {
        match dims.locate(i) {
            Source::X(r) => x_src[r] = Some(t),
            Source::Y(r) => y_src[r] = Some(t),
        }
    }

    let src = packed.data();
    let fill = |dst: &mut [f32], from: &Option<usize>| {
        if let Some(t) = *from {
            dst.copy_from_slice(&src[t * row..(t + 1) * row]);
        }
    };
    x.data_mut().par_chunks_mut(row).zip(x_src.par_iter()).for_each(|(d, s)| fill(d, s));
    y.data_mut().par_chunks_mut(row).zip(y_src.par_iter()).for_each(|(d, s)| fill(d, s));
    Ok((x, y))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KERNELS: [PackKernel; 2] = [PackKernel::Reference, PackKernel::Parallel];

    fn sources(b: usize, n: usize, l: usize, h: usize, d: usize) -> (Tensor, Tensor) {
        let x = Tensor::from_fn(&[b, n, h, d], |i| i as f32 + 1.0);
        let y = Tensor::from_fn(&[b, l, h, d], |i| -(i as f32) - 1.0);
        (x, y)
    }

    #[test]
    fn index_decoding() {
        // B=2, N=3, L=2, one scalar per token.
        let (x, y) = sources(2, 3, 2, 1, 1);
        for k in KERNELS {
            let p = k.pack(&x, &y, &[0, 3, 5, 9]).unwrap();
            // 0 → X[0,0]; 3 → Y[0,0]; 5 → X[1,0]; 9 → Y[1,1]
            assert_eq!(p.data(), &[1.0, -1.0, 4.0, -4.0], "{k:?}");
        }
    }

    #[test]
    fn empty_index_list() {
        let (x, y) = sources(1, 2, 2, 2, 4);
        for k in KERNELS {
            let p = k.pack(&x, &y, &[]).unwrap();
            assert_eq!(p.shape(), &[0, 2, 4]);
            let (xu, yu) = k.unpack(&p, &[], 1, 2, 2).unwrap();
            assert!(xu.data().iter().chain(yu.data()).all(|&v| v == 0.0));
        }
    }

    #[test]
    fn out_of_range_index_fails_fast() {
        let (x, y) = sources(1, 2, 2, 1, 2);
        for k in KERNELS {
            assert!(matches!(k.pack(&x, &y, &[4]), Err(OpsError::ContractViolation(_))));
            assert!(matches!(k.pack(&x, &y, &[-1]), Err(OpsError::ContractViolation(_))));
            let packed = Tensor::zeros(&[1, 1, 2]);
            assert!(k.unpack(&packed, &[4], 1, 2, 2).is_err());
        }
    }

    #[test]
    fn mismatched_shapes_rejected() {
        let x = Tensor::zeros(&[1, 2, 2, 4]);
        let y = Tensor::zeros(&[1, 2, 2, 8]);
        assert!(PackKernel::Reference.pack(&x, &y, &[0]).is_err());

        let packed = Tensor::zeros(&[2, 2, 4]);
        assert!(PackKernel::Parallel.unpack(&packed, &[0], 1, 2, 2).is_err());
    }

    #[test]
    fn untouched_positions_are_zero() {
        let (x, y) = sources(1, 3, 2, 2, 2);
        for k in KERNELS {
            let p = k.pack(&x, &y, &[1, 4]).unwrap();
            let (xu, yu) = k.unpack(&p, &[1, 4], 1, 3, 2).unwrap();
            assert_eq!(&xu.data()[0..4], &[0.0; 4]);
            assert_eq!(&xu.data()[4..8], &x.data()[4..8]);
            assert_eq!(&xu.data()[8..12], &[0.0; 4]);
            assert_eq!(&yu.data()[0..4], &[0.0; 4]);
            assert_eq!(&yu.data()[4..8], &y.data()[4..8]);
        }
    }

    #[test]
    fn explicit_choice_is_honored() {
        assert_eq!(PackKernel::select(PackKernelChoice::Reference), PackKernel::Reference);
    }

    fn case() -> impl Strategy<Value = (usize, usize, usize, usize, Vec<usize>)> {
        (1usize..4, 0usize..6, 0usize..6, 1usize..5)
            .prop_filter("need at least one token", |(_, n, l, _)| n + l > 0)
            .prop_flat_map(|(b, n, l, row)| {
                let total = b * (n + l);
                (
                    Just(b),
                    Just(n),
                    Just(l),
                    Just(row),
                    Just((0..total).collect::<Vec<_>>()).prop_shuffle(),
                    0..=total,
                )
                    .prop_map(|(b, n, l, row, perm, keep)| (b, n, l, row, perm[..keep].to_vec()))
            })
    }

    proptest! {
        #[test]
        fn round_trip_restores_touched_positions((b, n, l, row, picked) in case()) {
            let (x, y) = sources(b, n, l, 1, row);
            let indices: Vec<i64> = picked.iter().map(|&i| i as i64).collect();

            let reference = PackKernel::Reference.pack(&x, &y, &indices).unwrap();
            let parallel = PackKernel::Parallel.pack(&x, &y, &indices).unwrap();
            prop_assert_eq!(&reference, &parallel);

            for k in KERNELS {
                let (xu, yu) = k.unpack(&reference, &indices, b, n, l).unwrap();
                for r in 0..b * (n + l) {
                    let (src, dst, local) = if r % (n + l) < n {
                        (&x, &xu, (r / (n + l)) * n + r % (n + l))
                    } else {
                        (&y, &yu, (r / (n + l)) * l + r % (n + l) - n)
                    };
                    let want = &src.data()[local * row..(local + 1) * row];
                    let got = &dst.data()[local * row..(local + 1) * row];
                    if picked.contains(&r) {
                        prop_assert_eq!(got, want);
                    } else {
                        prop_assert!(got.iter().all(|&v| v == 0.0));
                    }
                }
            }
        }
    }
}
