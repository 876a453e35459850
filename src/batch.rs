use burn::prelude::*;

/// One batch of forecasting windows, as produced by an external windowing
/// collaborator.
///
/// Shapes, with `L` the lookback, `h` the horizon:
/// - `insample_y`: `[batch, L, n_series]` (`n_series` is 1 for the
///   univariate models, the full series count for TSMixer)
/// - `insample_mask`: `[batch, L]`, 1.0 where the window is observed
/// - `hist_exog`: `[batch, L, hist_exog_size]`
/// - `futr_exog`: `[batch, L + h, futr_exog_size]`
/// - `stat_exog`: `[batch, stat_exog_size]`
///
/// The optional tensors are `Some` exactly when the matching feature count
/// was non-zero at model construction. Models decide what to read from the
/// presence of their own projection submodules, not from per-batch checks.
#[derive(Debug, Clone)]
pub struct WindowsBatch<B: Backend> {
    pub insample_y: Tensor<B, 3>,
    pub insample_mask: Tensor<B, 2>,
    pub hist_exog: Option<Tensor<B, 3>>,
    pub futr_exog: Option<Tensor<B, 3>>,
    pub stat_exog: Option<Tensor<B, 2>>,
}

impl<B: Backend> WindowsBatch<B> {
    /// Batch carrying only the target series (any channel count), no
    /// exogenous features, mask all ones.
    pub fn from_target(insample_y: Tensor<B, 3>) -> Self {
        let [batch, len, _] = insample_y.dims();
        let mask = Tensor::ones([batch, len], &insample_y.device());
        Self {
            insample_y,
            insample_mask: mask,
            hist_exog: None,
            futr_exog: None,
            stat_exog: None,
        }
    }
}
