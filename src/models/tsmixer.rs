//! Multivariate time/feature mixing forecaster.
//!
//! Alternates per-time-step and per-series MLP mixing with residual
//! connections, wrapped in a reversible per-series instance normalization so
//! the network mixes standardized series and the forecast is mapped back to
//! the original scale.

use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::WindowsBatch;
use crate::error::ModelError;
use crate::output::OutputAdapter;
use crate::revin::ReversibleInstanceNorm;

// The mixers batch-normalize the fully flattened window, so the norm sees
// n_series * input_size "channels" with a length-1 spatial axis.
fn flat_norm<B: Backend>(x: Tensor<B, 2>, norm: &BatchNorm<B, 1>) -> Tensor<B, 2> {
    norm.forward(x.unsqueeze_dim::<3>(2)).squeeze::<2>(2)
}

/// Per-time-step linear mixing across the time axis.
#[derive(Module, Debug)]
struct TemporalMixing<B: Backend> {
    norm: BatchNorm<B, 1>,
    lin: Linear<B>,
    drop: Dropout,
}

impl<B: Backend> TemporalMixing<B> {
    fn new(n_series: usize, input_size: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(n_series * input_size)
                .with_epsilon(1e-3)
                .with_momentum(0.01)
                .init(device),
            lin: LinearConfig::new(input_size, input_size).init(device),
            drop: DropoutConfig::new(dropout).init(),
        }
    }

    fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, input_size, n_series] = input.dims();

        let x = input.clone().swap_dims(1, 2).reshape([batch, n_series * input_size]);
        let x = flat_norm(x, &self.norm).reshape([batch, n_series, input_size]);
        let x = relu(self.lin.forward(x)).swap_dims(1, 2);
        self.drop.forward(x) + input
    }
}

/// Two-layer MLP mixing across the series axis.
#[derive(Module, Debug)]
struct FeatureMixing<B: Backend> {
    norm: BatchNorm<B, 1>,
    lin1: Linear<B>,
    lin2: Linear<B>,
    drop1: Dropout,
    drop2: Dropout,
}

impl<B: Backend> FeatureMixing<B> {
    fn new(
        n_series: usize,
        input_size: usize,
        dropout: f64,
        ff_dim: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            norm: BatchNormConfig::new(n_series * input_size)
                .with_epsilon(1e-3)
                .with_momentum(0.01)
                .init(device),
            lin1: LinearConfig::new(n_series, ff_dim).init(device),
            lin2: LinearConfig::new(ff_dim, n_series).init(device),
            drop1: DropoutConfig::new(dropout).init(),
            drop2: DropoutConfig::new(dropout).init(),
        }
    }

    fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, input_size, n_series] = input.dims();

        let x = input.clone().reshape([batch, input_size * n_series]);
        let x = flat_norm(x, &self.norm).reshape([batch, input_size, n_series]);
        let x = self.drop1.forward(relu(self.lin1.forward(x)));
        let x = self.drop2.forward(self.lin2.forward(x));
        x + input
    }
}

#[derive(Module, Debug)]
struct MixingLayer<B: Backend> {
    temporal: TemporalMixing<B>,
    feature: FeatureMixing<B>,
}

impl<B: Backend> MixingLayer<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.feature.forward(self.temporal.forward(x))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsMixerConfig {
    pub h: usize,
    pub input_size: usize,
    pub n_series: usize,
    pub n_block: usize,
    pub ff_dim: usize,
    pub dropout: f64,
    pub revin: bool,
}

impl TsMixerConfig {
    pub fn new(h: usize, input_size: usize, n_series: usize) -> Self {
        Self {
            h,
            input_size,
            n_series,
            n_block: 2,
            ff_dim: 64,
            dropout: 0.9,
            revin: true,
        }
    }

    #[must_use]
    pub fn with_n_block(mut self, n_block: usize) -> Self {
        self.n_block = n_block;
        self
    }

    #[must_use]
    pub fn with_ff_dim(mut self, ff_dim: usize) -> Self {
        self.ff_dim = ff_dim;
        self
    }

    #[must_use]
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    #[must_use]
    pub fn with_revin(mut self, revin: bool) -> Self {
        self.revin = revin;
        self
    }

    pub fn init<B: Backend>(
        &self,
        output: &impl OutputAdapter<B>,
        device: &B::Device,
    ) -> Result<TsMixer<B>, ModelError> {
        if self.h == 0 || self.input_size == 0 || self.n_series == 0 {
            return Err(ModelError::invalid(
                "h, input_size and n_series must be positive",
            ));
        }
        if self.ff_dim == 0 {
            return Err(ModelError::invalid("ff_dim must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::invalid("dropout must be in [0, 1)"));
        }

        let width = output.outputsize_multiplier();
        debug!(n_block = self.n_block, width, "building mixing stack");

        let mixing_layers = (0..self.n_block)
            .map(|_| MixingLayer {
                temporal: TemporalMixing::new(self.n_series, self.input_size, self.dropout, device),
                feature: FeatureMixing::new(
                    self.n_series,
                    self.input_size,
                    self.dropout,
                    self.ff_dim,
                    device,
                ),
            })
            .collect();

        Ok(TsMixer {
            norm: self
                .revin
                .then(|| ReversibleInstanceNorm::new(self.n_series, device)),
            mixing_layers,
            out: LinearConfig::new(self.input_size, self.h * width).init(device),
            h: self.h,
            n_series: self.n_series,
            out_features: width,
        })
    }
}

#[derive(Module, Debug)]
pub struct TsMixer<B: Backend> {
    norm: Option<ReversibleInstanceNorm<B>>,
    mixing_layers: Vec<MixingLayer<B>>,
    out: Linear<B>,
    h: usize,
    n_series: usize,
    out_features: usize,
}

impl<B: Backend> TsMixer<B> {
    /// `insample_y` carries all series: `[batch, input_size, n_series]`.
    /// Returns `[batch, h, outputsize_multiplier * n_series]`.
    pub fn forward(
        &self,
        batch: &WindowsBatch<B>,
        output: &impl OutputAdapter<B>,
    ) -> Tensor<B, 3> {
        let x = batch.insample_y.clone();
        let batch_size = x.dims()[0];

        let (mut x, stats) = match &self.norm {
            Some(norm) => {
                let (x, stats) = norm.forward(x);
                (x, Some(stats))
            }
            None => (x, None),
        };

        for layer in &self.mixing_layers {
            x = layer.forward(x);
        }

        // [B, L, N] -> [B, h * width, N]
        let x = self.out.forward(x.swap_dims(1, 2)).swap_dims(1, 2);

        let x = match (&self.norm, stats) {
            (Some(norm), Some(stats)) => norm.reverse(x, &stats),
            _ => x,
        };

        let forecast = x.reshape([batch_size, self.h, self.out_features * self.n_series]);
        output.domain_map(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PointOutput;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray;

    fn multivariate_batch(
        batch: usize,
        lookback: usize,
        n_series: usize,
    ) -> WindowsBatch<TestBackend> {
        let device = Default::default();
        WindowsBatch::from_target(Tensor::random(
            [batch, lookback, n_series],
            Distribution::Normal(1.0, 2.0),
            &device,
        ))
    }

    #[test]
    fn forecast_shape_multivariate() {
        let device = Default::default();
        let output = PointOutput;
        let model = TsMixerConfig::new(4, 16, 3)
            .with_ff_dim(8)
            .with_dropout(0.0)
            .init::<TestBackend>(&output, &device)
            .unwrap();

        let forecast = model.forward(&multivariate_batch(4, 16, 3), &output);
        assert_eq!(forecast.dims(), [4, 4, 3]);
    }

    #[test]
    fn revin_toggle_does_not_change_shape() {
        let device = Default::default();
        let output = PointOutput;
        let windows = multivariate_batch(2, 16, 1);

        for revin in [true, false] {
            let model = TsMixerConfig::new(4, 16, 1)
                .with_ff_dim(8)
                .with_dropout(0.0)
                .with_revin(revin)
                .init::<TestBackend>(&output, &device)
                .unwrap();
            assert_eq!(model.forward(&windows, &output).dims(), [2, 4, 1]);
        }
    }
}
