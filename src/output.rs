use burn::prelude::*;

/// Contract between a model and the loss/distribution it feeds.
///
/// The multiplier sizes every final projection layer at construction time
/// (how many numbers the loss needs per forecast step); `domain_map` is the
/// loss-owned transform applied to the raw output right before it is handed
/// back to the caller. Models never look past this interface.
pub trait OutputAdapter<B: Backend> {
    /// Output values per forecast step, >= 1. 1 for point losses, the number
    /// of quantiles for quantile losses, the parameter count for
    /// distribution losses.
    fn outputsize_multiplier(&self) -> usize;

    /// Map unconstrained network outputs into the loss domain.
    fn domain_map(&self, output: Tensor<B, 3>) -> Tensor<B, 3>;
}

/// Point forecast adapter (MAE/MSE style): one value per step, identity map.
#[derive(Debug, Clone, Default)]
pub struct PointOutput;

impl<B: Backend> OutputAdapter<B> for PointOutput {
    fn outputsize_multiplier(&self) -> usize {
        1
    }

    fn domain_map(&self, output: Tensor<B, 3>) -> Tensor<B, 3> {
        output
    }
}

/// Quantile forecast adapter: one value per quantile level per step.
#[derive(Debug, Clone)]
pub struct QuantileOutput {
    quantiles: Vec<f64>,
}

impl QuantileOutput {
    pub fn new(quantiles: Vec<f64>) -> Self {
        Self { quantiles }
    }

    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }
}

impl<B: Backend> OutputAdapter<B> for QuantileOutput {
    fn outputsize_multiplier(&self) -> usize {
        self.quantiles.len()
    }

    fn domain_map(&self, output: Tensor<B, 3>) -> Tensor<B, 3> {
        output
    }
}
