//! Numeric primitives behind the chunked power attention path.
//!
//! The four primitives (attention block, chunk state, discounted cumulative
//! sum and query state) each come in a materialised and a blocked variant.
//! [`PowerKernels`] bundles one choice per primitive and [`select_kernels`]
//! picks a provider once per call from a [`KernelKey`].

pub mod attention_block;
pub mod chunk_state;
pub mod discumsum;
pub mod expansion;
pub mod normalize;
pub mod query_state;
pub mod tuning;

use std::fmt;

use candle_core::{DType, Result, Tensor, D};

use crate::core::BackendSelection;

pub use attention_block::{BlockOptions, BlockOutput};
pub use expansion::{expanded_dim, SymmetricPowerMap};
pub use tuning::TuningParams;

/// Problem signature used to resolve a kernel provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelKey {
    pub head_dim: usize,
    pub value_dim: usize,
    pub deg: usize,
    pub dtype: DType,
    pub chunk_len: usize,
}

/// One implementation choice for each chunked primitive.
///
/// Shapes follow the free functions in the submodules; every tensor is `f32`.
pub trait PowerKernels: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        gate_q: Option<&Tensor>,
        gate_k: Option<&Tensor>,
        options: &BlockOptions,
    ) -> Result<BlockOutput>;

    fn chunk_state(&self, k: &Tensor, v: &Tensor, map: &SymmetricPowerMap) -> Result<Tensor>;

    /// Scan kind depends only on `deterministic`.
    fn discumsum(&self, states: &Tensor, log_g: &Tensor, deterministic: bool) -> Result<Tensor> {
        if deterministic {
            discumsum::discumsum_sequential(states, log_g)
        } else {
            discumsum::discumsum_tree(states, log_g)
        }
    }

    fn query_state(
        &self,
        q: &Tensor,
        states: &Tensor,
        y_local: &Tensor,
        rowmax: &Tensor,
        map: &SymmetricPowerMap,
        stabilizer: f64,
    ) -> Result<Tensor>;
}

/// Fully materialised, single-contraction kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

impl PowerKernels for ReferenceKernels {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        gate_q: Option<&Tensor>,
        gate_k: Option<&Tensor>,
        options: &BlockOptions,
    ) -> Result<BlockOutput> {
        attention_block::attention_exact(q, k, v, gate_q, gate_k, options)
    }

    fn chunk_state(&self, k: &Tensor, v: &Tensor, map: &SymmetricPowerMap) -> Result<Tensor> {
        chunk_state::chunk_state(k, v, map)
    }

    fn query_state(
        &self,
        q: &Tensor,
        states: &Tensor,
        y_local: &Tensor,
        rowmax: &Tensor,
        map: &SymmetricPowerMap,
        stabilizer: f64,
    ) -> Result<Tensor> {
        query_state::query_state(q, states, y_local, rowmax, map, stabilizer)
    }
}

/// Key-block streaming attention with time- and query-blocked contractions.
#[derive(Debug, Clone, Copy)]
pub struct StreamingKernels {
    pub params: TuningParams,
}

impl PowerKernels for StreamingKernels {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        gate_q: Option<&Tensor>,
        gate_k: Option<&Tensor>,
        options: &BlockOptions,
    ) -> Result<BlockOutput> {
        attention_block::attention_streaming(q, k, v, gate_q, gate_k, options, self.params.key_block)
    }

    fn chunk_state(&self, k: &Tensor, v: &Tensor, map: &SymmetricPowerMap) -> Result<Tensor> {
        chunk_state::chunk_state_blocked(k, v, map, self.params.time_block)
    }

    fn query_state(
        &self,
        q: &Tensor,
        states: &Tensor,
        y_local: &Tensor,
        rowmax: &Tensor,
        map: &SymmetricPowerMap,
        stabilizer: f64,
    ) -> Result<Tensor> {
        query_state::query_state_blocked(
            q,
            states,
            y_local,
            rowmax,
            map,
            stabilizer,
            self.params.query_block,
        )
    }
}

/// Resolve the kernel provider for one call. Pure in `key` and `selection`.
pub fn select_kernels(key: &KernelKey, selection: BackendSelection) -> Box<dyn PowerKernels> {
    let params = tuning::lookup(key);
    let kernels: Box<dyn PowerKernels> = match selection {
        BackendSelection::ReferenceOnly => Box::new(ReferenceKernels),
        BackendSelection::StreamingOnly => Box::new(StreamingKernels { params }),
        BackendSelection::Auto if params.prefer_streaming => Box::new(StreamingKernels { params }),
        BackendSelection::Auto => Box::new(ReferenceKernels),
    };
    log::debug!(
        "power_attention::kernels selected={} selection={:?} key={:?} params={:?}",
        kernels.name(),
        selection,
        key,
        params
    );
    kernels
}

/// Repeat each head `ratio` times along `dim` so grouped kv heads line up
/// with query heads. Query head `i` reads kv head `i / ratio`.
pub fn repeat_heads(x: &Tensor, ratio: usize, dim: usize) -> Result<Tensor> {
    if ratio == 1 {
        return Ok(x.clone());
    }
    let mut expanded = x.dims().to_vec();
    expanded.insert(dim + 1, ratio);
    let mut merged = x.dims().to_vec();
    merged[dim] *= ratio;
    x.unsqueeze(dim + 1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(merged)
}

/// Matrix product over the last two dims, with any number of matching
/// leading dims folded into one batch axis first.
pub fn batched_matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let lhs_dims = lhs.dims();
    let rhs_dims = rhs.dims();
    let rank = lhs_dims.len();
    if rank < 2 || rhs_dims.len() != rank {
        candle_core::bail!("batched_matmul: rank mismatch {lhs_dims:?} x {rhs_dims:?}");
    }
    let lead = &lhs_dims[..rank - 2];
    if lead != &rhs_dims[..rank - 2] {
        candle_core::bail!("batched_matmul: leading dims differ {lhs_dims:?} x {rhs_dims:?}");
    }
    let batch: usize = lead.iter().product();
    let (m, k) = (lhs_dims[rank - 2], lhs_dims[rank - 1]);
    let n = rhs_dims[rank - 1];
    let lhs = lhs.contiguous()?.reshape((batch, m, k))?;
    let rhs = rhs.contiguous()?.reshape((batch, rhs_dims[rank - 2], n))?;
    let mut out_dims = lead.to_vec();
    out_dims.extend([m, n]);
    lhs.matmul(&rhs)?.reshape(out_dims)
}

/// Inclusive cumulative sum along `dim`.
pub fn cumsum_along(x: &Tensor, dim: usize) -> Result<Tensor> {
    let last = x.rank() - 1;
    if dim == last {
        return x.contiguous()?.cumsum(D::Minus1);
    }
    x.transpose(dim, last)?
        .contiguous()?
        .cumsum(D::Minus1)?
        .transpose(dim, last)?
        .contiguous()
}

/// Append a ones column to the value features; attention over it yields the
/// normaliser alongside the numerator.
pub fn append_normalizer_column(v: &Tensor) -> Result<Tensor> {
    let mut shape = v.dims().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = 1;
    }
    let ones = Tensor::ones(shape, v.dtype(), v.device())?;
    Tensor::cat(&[v, &ones], D::Minus1)
}

/// Split off the trailing normaliser column and divide by it, keeping its
/// sign and bounding its magnitude below by `eps`.
pub fn divide_by_normalizer(y: &Tensor, eps: f64) -> Result<Tensor> {
    let width = y.dim(D::Minus1)?;
    if width < 2 {
        candle_core::bail!("expected a value column plus a normaliser column, got width {width}");
    }
    let numerator = y.narrow(D::Minus1, 0, width - 1)?;
    let denominator = y.narrow(D::Minus1, width - 1, 1)?;
    let floor = Tensor::new(eps as f32, y.device())?;
    let safe = (denominator.abs()?.broadcast_maximum(&floor)? * sign_of(&denominator)?)?;
    numerator.broadcast_div(&safe)
}

/// `+1` where `x >= 0`, `-1` elsewhere; carries no gradient.
pub(crate) fn sign_of(x: &Tensor) -> Result<Tensor> {
    let x = x.detach();
    let positive = x.ge(&x.zeros_like()?)?;
    let ones = x.ones_like()?;
    positive.where_cond(&ones, &ones.neg()?)
}
