use burn::module::Param;
use burn::prelude::*;

/// Per-pass statistics recorded by [`ReversibleInstanceNorm::forward`].
///
/// Valid only for the batch that produced them; `reverse` takes them as an
/// explicit argument instead of the module caching them between calls.
#[derive(Debug, Clone)]
pub struct RevinStats<B: Backend> {
    mean: Tensor<B, 3>,
    std: Tensor<B, 3>,
}

/// Invertible per-series instance normalization.
///
/// Standardizes each batch item over the time axis with detached statistics,
/// then applies a learned per-series affine. `reverse` undoes the transform
/// exactly, to floating-point tolerance.
#[derive(Module, Debug)]
pub struct ReversibleInstanceNorm<B: Backend> {
    weight: Param<Tensor<B, 3>>,
    bias: Param<Tensor<B, 3>>,
    eps: f64,
}

impl<B: Backend> ReversibleInstanceNorm<B> {
    pub fn new(n_series: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([1, 1, n_series], device)),
            bias: Param::from_tensor(Tensor::zeros([1, 1, n_series], device)),
            eps: 1e-5,
        }
    }

    /// `x`: `[batch, time, n_series]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, RevinStats<B>) {
        let mean = x.clone().mean_dim(1).detach();
        let std = (x.clone().var_bias(1) + self.eps).sqrt().detach();

        let x = (x - mean.clone()) / std.clone();
        let x = x * self.weight.val() + self.bias.val();
        (x, RevinStats { mean, std })
    }

    /// Inverse of `forward` for any tensor sharing the series axis, e.g. the
    /// projected forecast `[batch, horizon * width, n_series]`.
    pub fn reverse(&self, x: Tensor<B, 3>, stats: &RevinStats<B>) -> Tensor<B, 3> {
        let x = (x - self.bias.val()) / self.weight.val();
        x * stats.std.clone() + stats.mean.clone()
    }
}
