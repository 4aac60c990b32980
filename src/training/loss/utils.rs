//! Numerically stable helpers shared by the loss functions

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Elementwise `log(1 + exp(x))`, stable for large `|x|`.
///
/// Uses `softplus(x) = relu(x) + log(1 + exp(-|x|))`, so the exponent is
/// never positive and the gradient is defined everywhere.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((xs.relu()? + tail)?)
}

/// Elementwise `log(sigmoid(x))`
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    Ok(softplus(&xs.neg()?)?.neg()?)
}

/// Scalar counterpart of [`softplus`]
pub fn softplus_f64(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Mean of all elements as `f64`
pub fn mean_scalar(xs: &Tensor) -> Result<f64> {
    Ok(xs.to_dtype(DType::F64)?.mean_all()?.to_scalar::<f64>()?)
}

/// Read a rank-1 tensor back as `f64` values
pub fn to_f64_vec(xs: &Tensor) -> Result<Vec<f64>> {
    Ok(xs.to_dtype(DType::F64)?.to_vec1::<f64>()?)
}
