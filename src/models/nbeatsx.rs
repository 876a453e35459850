//! Basis-expansion forecaster with exogenous inputs.
//!
//! A stack of MLP blocks, each projecting the flattened inputs to basis
//! coefficients. Blocks subtract their backcast from a running residual
//! (time-reversed window) and add their forecast to a running total seeded
//! with the naive last-value baseline.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::basis::Basis;
use crate::batch::WindowsBatch;
use crate::error::ModelError;
use crate::output::OutputAdapter;

#[derive(Module, Debug)]
pub struct NBeatsBlock<B: Backend> {
    input_lin: Linear<B>,
    hidden: Vec<Linear<B>>,
    out_lin: Linear<B>,
    activation: Activation,
    basis: Basis<B>,
    hist_exog_size: usize,
    futr_exog_size: usize,
    stat_exog_size: usize,
}

impl<B: Backend> NBeatsBlock<B> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        input_size: usize,
        h: usize,
        exog: (usize, usize, usize),
        mlp_units: &[[usize; 2]],
        basis: Basis<B>,
        activation: Activation,
        device: &B::Device,
    ) -> Self {
        let (hist, futr, stat) = exog;
        // Flattened block input: residual window, historical exogenous over
        // the window, future exogenous over window + horizon, statics.
        let flat_input = input_size + hist * input_size + futr * (input_size + h) + stat;

        let input_lin = LinearConfig::new(flat_input, mlp_units[0][0]).init(device);
        let hidden = mlp_units
            .iter()
            .map(|&[in_f, out_f]| LinearConfig::new(in_f, out_f).init(device))
            .collect();
        let out_lin =
            LinearConfig::new(mlp_units.last().unwrap()[1], basis.n_theta()).init(device);

        Self {
            input_lin,
            hidden,
            out_lin,
            activation,
            basis,
            hist_exog_size: hist,
            futr_exog_size: futr,
            stat_exog_size: stat,
        }
    }

    /// Returns `(backcast [B, L], forecast [B, h, W])`.
    pub fn forward(
        &self,
        residuals: Tensor<B, 2>,
        batch: &WindowsBatch<B>,
    ) -> (Tensor<B, 2>, Tensor<B, 3>) {
        let batch_size = residuals.dims()[0];
        let mut x = residuals;

        if self.hist_exog_size > 0 {
            let hist = batch.hist_exog.clone().expect("hist_exog configured but missing");
            let [_, l, f] = hist.dims();
            x = Tensor::cat(vec![x, hist.reshape([batch_size, l * f])], 1);
        }
        if self.futr_exog_size > 0 {
            let futr = batch.futr_exog.clone().expect("futr_exog configured but missing");
            let [_, l, f] = futr.dims();
            x = Tensor::cat(vec![x, futr.reshape([batch_size, l * f])], 1);
        }
        if self.stat_exog_size > 0 {
            let stat = batch.stat_exog.clone().expect("stat_exog configured but missing");
            x = Tensor::cat(vec![x, stat], 1);
        }

        let mut x = self.input_lin.forward(x);
        for lin in &self.hidden {
            x = self.activation.forward(lin.forward(x));
        }
        let theta = self.out_lin.forward(x);
        self.basis.project(theta)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NBeatsXConfig {
    pub h: usize,
    pub input_size: usize,
    pub hist_exog_size: usize,
    pub futr_exog_size: usize,
    pub stat_exog_size: usize,
    pub n_harmonics: usize,
    pub n_polynomials: usize,
    /// One entry per stack, from {"identity", "trend", "seasonality"}.
    pub stack_types: Vec<String>,
    /// Blocks per stack, same length as `stack_types`.
    pub n_blocks: Vec<usize>,
    /// (in, out) widths of the hidden MLP layers, shared by every block.
    pub mlp_units: Vec<[usize; 2]>,
    /// Must stay 0; kept explicit so the unsupported combination fails loudly.
    pub dropout_prob_theta: f64,
    pub activation: String,
    /// Alias parameters across blocks of the same stack instead of copying.
    pub shared_weights: bool,
}

impl NBeatsXConfig {
    pub fn new(h: usize, input_size: usize) -> Self {
        Self {
            h,
            input_size,
            hist_exog_size: 0,
            futr_exog_size: 0,
            stat_exog_size: 0,
            n_harmonics: 2,
            n_polynomials: 2,
            stack_types: vec![
                "identity".to_string(),
                "trend".to_string(),
                "seasonality".to_string(),
            ],
            n_blocks: vec![1, 1, 1],
            mlp_units: vec![[512, 512]; 3],
            dropout_prob_theta: 0.0,
            activation: "ReLU".to_string(),
            shared_weights: false,
        }
    }

    #[must_use]
    pub fn with_exog(mut self, hist: usize, futr: usize, stat: usize) -> Self {
        self.hist_exog_size = hist;
        self.futr_exog_size = futr;
        self.stat_exog_size = stat;
        self
    }

    #[must_use]
    pub fn with_stacks(mut self, stack_types: Vec<String>, n_blocks: Vec<usize>) -> Self {
        self.stack_types = stack_types;
        self.n_blocks = n_blocks;
        self
    }

    #[must_use]
    pub fn with_mlp_units(mut self, mlp_units: Vec<[usize; 2]>) -> Self {
        self.mlp_units = mlp_units;
        self
    }

    #[must_use]
    pub fn with_activation(mut self, activation: impl Into<String>) -> Self {
        self.activation = activation.into();
        self
    }

    #[must_use]
    pub fn with_shared_weights(mut self, shared_weights: bool) -> Self {
        self.shared_weights = shared_weights;
        self
    }

    #[must_use]
    pub fn with_dropout_prob_theta(mut self, dropout_prob_theta: f64) -> Self {
        self.dropout_prob_theta = dropout_prob_theta;
        self
    }

    fn basis<B: Backend>(
        &self,
        stack_type: &str,
        out_features: usize,
        device: &B::Device,
    ) -> Result<Basis<B>, ModelError> {
        match stack_type {
            "identity" => Ok(Basis::identity(self.input_size, self.h, out_features)),
            "trend" => Ok(Basis::trend(
                self.n_polynomials,
                self.input_size,
                self.h,
                out_features,
                device,
            )),
            "seasonality" => Basis::seasonality(
                self.n_harmonics,
                self.input_size,
                self.h,
                out_features,
                device,
            ),
            other => Err(ModelError::UnknownStackType {
                name: other.to_string(),
            }),
        }
    }

    pub fn init<B: Backend>(
        &self,
        output: &impl OutputAdapter<B>,
        device: &B::Device,
    ) -> Result<NBeatsX<B>, ModelError> {
        if self.h == 0 || self.input_size == 0 {
            return Err(ModelError::invalid("h and input_size must be positive"));
        }
        if self.dropout_prob_theta > 0.0 {
            return Err(ModelError::DropoutNotImplemented {
                dropout: self.dropout_prob_theta,
            });
        }
        if self.stack_types.len() != self.n_blocks.len() {
            return Err(ModelError::invalid(
                "stack_types and n_blocks must have the same length",
            ));
        }
        if self.mlp_units.is_empty() {
            return Err(ModelError::invalid("mlp_units must not be empty"));
        }
        for pair in self.mlp_units.windows(2) {
            if pair[0][1] != pair[1][0] {
                return Err(ModelError::invalid(format!(
                    "mlp_units do not chain: {} -> {}",
                    pair[0][1], pair[1][0]
                )));
            }
        }
        let activation = Activation::parse(&self.activation)?;
        let width = output.outputsize_multiplier();

        let mut blocks: Vec<NBeatsBlock<B>> = Vec::new();
        for (stack_type, &n_blocks) in self.stack_types.iter().zip(&self.n_blocks) {
            for block_id in 0..n_blocks {
                if self.shared_weights && block_id > 0 {
                    // Clone keeps the parameter ids, so this is aliasing,
                    // not an independent copy.
                    blocks.push(blocks.last().unwrap().clone());
                } else {
                    let basis = self.basis(stack_type, width, device)?;
                    blocks.push(NBeatsBlock::new(
                        self.input_size,
                        self.h,
                        (self.hist_exog_size, self.futr_exog_size, self.stat_exog_size),
                        &self.mlp_units,
                        basis,
                        activation,
                        device,
                    ));
                }
            }
        }
        debug!(n_blocks = blocks.len(), "built basis-expansion stack");

        Ok(NBeatsX {
            blocks,
            h: self.h,
            out_features: width,
        })
    }
}

#[derive(Module, Debug)]
pub struct NBeatsX<B: Backend> {
    blocks: Vec<NBeatsBlock<B>>,
    h: usize,
    out_features: usize,
}

impl<B: Backend> NBeatsX<B> {
    /// Naive last-value baseline broadcast over the horizon, `[B, h, W]`.
    fn naive_level(&self, insample_y: &Tensor<B, 2>) -> Tensor<B, 3> {
        let len = insample_y.dims()[1];
        insample_y
            .clone()
            .narrow(1, len - 1, 1)
            .unsqueeze_dim::<3>(2)
            .repeat_dim(1, self.h)
            .repeat_dim(2, self.out_features)
    }

    fn run(&self, batch: &WindowsBatch<B>) -> (Tensor<B, 3>, Vec<Tensor<B, 3>>) {
        let insample_y = batch.insample_y.clone().squeeze::<2>(2);
        let mut residuals = insample_y.clone().flip([1]);
        let mask = batch.insample_mask.clone().flip([1]);

        let naive = self.naive_level(&insample_y);
        let mut forecast = naive.clone();
        let mut block_forecasts = vec![naive];

        for block in &self.blocks {
            let (backcast, block_forecast) = block.forward(residuals.clone(), batch);
            residuals = (residuals - backcast) * mask.clone();
            forecast = forecast + block_forecast.clone();
            block_forecasts.push(block_forecast);
        }
        (forecast, block_forecasts)
    }

    /// `[batch, h, outputsize_multiplier]` forecast.
    pub fn forward(
        &self,
        batch: &WindowsBatch<B>,
        output: &impl OutputAdapter<B>,
    ) -> Tensor<B, 3> {
        let (forecast, _) = self.run(batch);
        output.domain_map(forecast)
    }

    /// Per-block decomposition `[batch, n_blocks + 1, h, W]`, with the naive
    /// baseline at index 0. Summing over the block axis reproduces the raw
    /// (not domain-mapped) forecast.
    pub fn forward_decomposed(&self, batch: &WindowsBatch<B>) -> Tensor<B, 4> {
        let (_, block_forecasts) = self.run(batch);
        Tensor::stack::<4>(block_forecasts, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{PointOutput, QuantileOutput};
    use burn::tensor::{Distribution, Tolerance};

    type TestBackend = burn::backend::NdArray;

    fn small_config() -> NBeatsXConfig {
        NBeatsXConfig::new(4, 16).with_mlp_units(vec![[32, 32]])
    }

    fn univariate_batch(batch: usize, lookback: usize) -> WindowsBatch<TestBackend> {
        let device = Default::default();
        WindowsBatch::from_target(Tensor::random(
            [batch, lookback, 1],
            Distribution::Default,
            &device,
        ))
    }

    #[test]
    fn forecast_shape_across_widths() {
        let device = Default::default();
        let windows = univariate_batch(4, 16);

        let point = PointOutput;
        let model = small_config().init::<TestBackend>(&point, &device).unwrap();
        assert_eq!(model.forward(&windows, &point).dims(), [4, 4, 1]);

        let quantile = QuantileOutput::new(vec![0.1, 0.5, 0.9]);
        let model = small_config().init::<TestBackend>(&quantile, &device).unwrap();
        assert_eq!(model.forward(&windows, &quantile).dims(), [4, 4, 3]);
    }

    #[test]
    fn decomposition_sums_to_forecast() {
        let device = Default::default();
        let output = PointOutput;
        let model = small_config().init::<TestBackend>(&output, &device).unwrap();
        let windows = univariate_batch(3, 16);

        let forecast = model.forward(&windows, &output);
        let decomposed = model.forward_decomposed(&windows);
        assert_eq!(decomposed.dims()[1], 4); // naive + 3 blocks

        let summed = decomposed.sum_dim(1).squeeze::<3>(1);
        summed
            .into_data()
            .assert_approx_eq::<f32>(&forecast.into_data(), Tolerance::default());
    }

    #[test]
    fn decomposition_with_exog_and_quantiles_sums_to_forecast() {
        let device = Default::default();
        let output = QuantileOutput::new(vec![0.1, 0.5, 0.9]);
        let (batch, lookback, h) = (3, 12, 5);
        let (hist, futr, stat) = (2, 1, 3);

        let model = NBeatsXConfig::new(h, lookback)
            .with_mlp_units(vec![[16, 16]])
            .with_stacks(
                vec!["identity".into(), "trend".into(), "seasonality".into()],
                vec![2, 1, 1],
            )
            .with_exog(hist, futr, stat)
            .init::<TestBackend>(&output, &device)
            .unwrap();

        let windows = WindowsBatch {
            insample_y: Tensor::random([batch, lookback, 1], Distribution::Default, &device),
            insample_mask: Tensor::ones([batch, lookback], &device),
            hist_exog: Some(Tensor::random(
                [batch, lookback, hist],
                Distribution::Default,
                &device,
            )),
            futr_exog: Some(Tensor::random(
                [batch, lookback + h, futr],
                Distribution::Default,
                &device,
            )),
            stat_exog: Some(Tensor::random([batch, stat], Distribution::Default, &device)),
        };

        let forecast = model.forward(&windows, &output);
        let decomposed = model.forward_decomposed(&windows);
        assert_eq!(decomposed.dims(), [batch, 5, h, 3]); // naive + 4 blocks

        let summed = decomposed.sum_dim(1).squeeze::<3>(1);
        summed
            .into_data()
            .assert_approx_eq::<f32>(&forecast.into_data(), Tolerance::default());
    }

    #[test]
    fn shared_weights_alias_blocks() {
        let device = Default::default();
        let output = PointOutput;
        let model = small_config()
            .with_stacks(vec!["identity".into()], vec![3])
            .with_shared_weights(true)
            .init::<TestBackend>(&output, &device)
            .unwrap();
        assert_eq!(model.blocks.len(), 3);
        // Cloned blocks keep their parameter ids: aliasing, not copies.
        assert_eq!(
            model.blocks[0].out_lin.weight.id,
            model.blocks[1].out_lin.weight.id
        );
        assert_eq!(
            model.blocks[1].out_lin.weight.id,
            model.blocks[2].out_lin.weight.id
        );
    }

    #[test]
    fn dropout_fails_construction() {
        let device = Default::default();
        let err = small_config()
            .with_dropout_prob_theta(0.2)
            .init::<TestBackend>(&PointOutput, &device)
            .unwrap_err();
        assert!(matches!(err, ModelError::DropoutNotImplemented { .. }));
    }

    #[test]
    fn unknown_stack_type_fails_construction() {
        let device = Default::default();
        let err = small_config()
            .with_stacks(vec!["wavelet".into()], vec![1])
            .init::<TestBackend>(&PointOutput, &device)
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownStackType { .. }));
    }

    #[test]
    fn unknown_activation_fails_construction() {
        let device = Default::default();
        let err = small_config()
            .with_activation("Swish")
            .init::<TestBackend>(&PointOutput, &device)
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownActivation { .. }));
    }

    #[test]
    fn exogenous_features_change_parameters_not_shape() {
        let device = Default::default();
        let output = PointOutput;
        let (batch, lookback, h) = (2, 16, 4);

        let plain = small_config().init::<TestBackend>(&output, &device).unwrap();
        let with_exog = small_config()
            .with_exog(3, 0, 0)
            .init::<TestBackend>(&output, &device)
            .unwrap();

        let mut windows = univariate_batch(batch, lookback);
        assert_eq!(plain.forward(&windows, &output).dims(), [batch, h, 1]);

        windows.hist_exog = Some(Tensor::random(
            [batch, lookback, 3],
            Distribution::Default,
            &device,
        ));
        assert_eq!(with_exog.forward(&windows, &output).dims(), [batch, h, 1]);
    }
}
