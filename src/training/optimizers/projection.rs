//! Radial projection shared by the decoupled optimizers
//!
//! For scale-invariant weights (followed by a normalisation layer) the radial
//! part of an update only inflates the weight norm. When the gradient is
//! nearly orthogonal to the weight, the update's component along the weight
//! direction is removed and weight decay is scaled down.

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Projection hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionParams {
    /// Cosine similarity threshold, divided by `sqrt(dim)` of the view
    pub delta: f64,
    /// Weight decay multiplier applied when the update was projected
    pub wd_ratio: f64,
    /// Numerical floor for norms
    pub eps: f64,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            delta: 0.1,
            wd_ratio: 0.1,
            eps: 1e-8,
        }
    }
}

/// Outcome of a projection attempt
#[derive(Debug, Clone)]
pub struct Projected {
    /// Update to apply, radial part removed when `projected` is set
    pub update: Tensor,
    /// Weight decay multiplier for this step
    pub wd_ratio: f64,
    /// Whether the radial part was removed
    pub projected: bool,
}

impl ProjectionParams {
    /// Project `update` for parameter `param` given its gradient
    ///
    /// Parameters of rank one or zero are returned untouched. Otherwise the
    /// channel view (one row per output channel) is tried first, then the
    /// whole-layer view.
    pub fn project(&self, param: &Tensor, grad: &Tensor, update: Tensor) -> Result<Projected> {
        if param.rank() <= 1 {
            return Ok(Projected {
                update,
                wd_ratio: 1.0,
                projected: false,
            });
        }

        let elems = param.elem_count();
        let channels = param.dim(0)?;
        for rows in [channels, 1] {
            let cols = elems / rows;
            let similarity = max_abs_cosine(grad, param, rows, cols, self.eps)?;
            if similarity < self.delta / (cols as f64).sqrt() {
                let p = param.reshape((rows, cols))?;
                let norm = (p.sqr()?.sum_keepdim(1)?.sqrt()? + self.eps)?;
                let p_n = p.broadcast_div(&norm)?;

                let u = update.reshape((rows, cols))?;
                let radial = (&p_n * &u)?.sum_keepdim(1)?;
                let u = (u - p_n.broadcast_mul(&radial)?)?;

                return Ok(Projected {
                    update: u.reshape(param.shape())?,
                    wd_ratio: self.wd_ratio,
                    projected: true,
                });
            }
        }

        Ok(Projected {
            update,
            wd_ratio: 1.0,
            projected: false,
        })
    }
}

/// Largest absolute row-wise cosine similarity of two tensors viewed as `[rows, cols]`
fn max_abs_cosine(x: &Tensor, y: &Tensor, rows: usize, cols: usize, eps: f64) -> Result<f64> {
    let x = x.reshape((rows, cols))?;
    let y = y.reshape((rows, cols))?;

    let dot = (&x * &y)?.sum(1)?;
    let norms = (x.sqr()?.sum(1)?.sqrt()? * y.sqr()?.sum(1)?.sqrt()?)?;
    let cosine = dot.div(&norms.maximum(eps)?)?.abs()?;

    Ok(cosine.max(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
