//! Selective-scan state-space forecaster.
//!
//! A window is standardized, embedded (token convolution + fixed sinusoidal
//! positions), run through a stack of pre-norm residual Mamba blocks and
//! projected back to the output width; the standardization is undone at the
//! boundary and the last `h` positions form the forecast.

use burn::module::Param;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig, PaddingConfig1d};
use burn::prelude::*;
use burn::tensor::activation::{silu, softplus};
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::WindowsBatch;
use crate::error::ModelError;
use crate::output::OutputAdapter;
use crate::scan::selective_scan;

/// Root-mean-square normalization over the channel axis.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    weight: Param<Tensor<B, 1>>,
    eps: f64,
}

impl<B: Backend> RmsNorm<B> {
    pub fn new(d_model: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([d_model], device)),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let rms = (x.clone().powf_scalar(2.0).mean_dim(2) + self.eps)
            .sqrt()
            .recip();
        x * rms * self.weight.val().unsqueeze::<3>()
    }
}

/// Width-3 circularly padded convolution lifting the scalar series into the
/// model width.
#[derive(Module, Debug)]
struct TokenEmbedding<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> TokenEmbedding<B> {
    fn new(c_in: usize, d_model: usize, device: &B::Device) -> Self {
        let conv = Conv1dConfig::new(c_in, d_model, 3)
            .with_padding(PaddingConfig1d::Valid)
            .with_bias(false)
            .with_initializer(Initializer::KaimingNormal {
                gain: std::f64::consts::SQRT_2,
                fan_out_only: false,
            })
            .init(device);
        Self { conv }
    }

    /// `x`: `[batch, time, c_in]`.
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.swap_dims(1, 2);
        let len = x.dims()[2];
        let left = x.clone().narrow(2, len - 1, 1);
        let right = x.clone().narrow(2, 0, 1);
        let x = Tensor::cat(vec![left, x, right], 2);
        self.conv.forward(x).swap_dims(1, 2)
    }
}

fn sinusoid_table<B: Backend>(max_len: usize, d_model: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut data = vec![0.0f32; max_len * d_model];
    for t in 0..max_len {
        for i in (0..d_model).step_by(2) {
            let div = (-(i as f64) * (10_000f64).ln() / d_model as f64).exp();
            let angle = t as f64 * div;
            data[t * d_model + i] = angle.sin() as f32;
            if i + 1 < d_model {
                data[t * d_model + i + 1] = angle.cos() as f32;
            }
        }
    }
    Tensor::from_data(TensorData::new(data, [max_len, d_model]), device)
}

/// Token + fixed positional embedding with dropout.
#[derive(Module, Debug)]
struct DataEmbedding<B: Backend> {
    token: TokenEmbedding<B>,
    positions: Tensor<B, 2>,
    drop: Dropout,
}

impl<B: Backend> DataEmbedding<B> {
    fn new(c_in: usize, d_model: usize, max_len: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            token: TokenEmbedding::new(c_in, d_model, device),
            positions: sinusoid_table(max_len, d_model, device),
            drop: DropoutConfig::new(dropout).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let len = x.dims()[1];
        let pe = self.positions.clone().narrow(0, 0, len).unsqueeze::<3>();
        self.drop.forward(self.token.forward(x) + pe)
    }
}

/// Gated selective-scan block.
#[derive(Module, Debug)]
pub struct MambaBlock<B: Backend> {
    in_proj: Linear<B>,
    conv1d: Conv1d<B>,
    x_proj: Linear<B>,
    dt_proj: Linear<B>,
    a_log: Param<Tensor<B, 2>>,
    d: Param<Tensor<B, 1>>,
    out_proj: Linear<B>,
    dt_rank: usize,
    state_dim: usize,
}

impl<B: Backend> MambaBlock<B> {
    pub fn new(
        d_model: usize,
        d_inner: usize,
        dt_rank: usize,
        conv_kernel: usize,
        state_dim: usize,
        device: &B::Device,
    ) -> Self {
        // ln(1..=n) per channel; negated and exponentiated at forward time so
        // the transition stays strictly negative.
        let a_log: Vec<f32> = (0..d_inner)
            .flat_map(|_| (1..=state_dim).map(|n| (n as f32).ln()))
            .collect();
        let a_log = Tensor::from_data(TensorData::new(a_log, [d_inner, state_dim]), device);

        Self {
            in_proj: LinearConfig::new(d_model, d_inner * 2)
                .with_bias(false)
                .init(device),
            conv1d: Conv1dConfig::new(d_inner, d_inner, conv_kernel)
                .with_groups(d_inner)
                .with_padding(PaddingConfig1d::Explicit(conv_kernel - 1))
                .init(device),
            x_proj: LinearConfig::new(d_inner, dt_rank + state_dim * 2)
                .with_bias(false)
                .init(device),
            dt_proj: LinearConfig::new(dt_rank, d_inner).init(device),
            a_log: Param::from_tensor(a_log),
            d: Param::from_tensor(Tensor::ones([d_inner], device)),
            out_proj: LinearConfig::new(d_inner, d_model)
                .with_bias(false)
                .init(device),
            dt_rank,
            state_dim,
        }
    }

    fn ssm(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let n = self.state_dim;
        let projected = self.x_proj.forward(x.clone());
        let delta = projected.clone().narrow(2, 0, self.dt_rank);
        let b = projected.clone().narrow(2, self.dt_rank, n);
        let c = projected.narrow(2, self.dt_rank + n, n);

        // Softplus keeps the step size positive by construction.
        let delta = softplus(self.dt_proj.forward(delta), 1.0);
        let a = self.a_log.val().exp().neg();
        selective_scan(x, delta, a, b, c, self.d.val())
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let len = x.dims()[1];
        let mut halves = self.in_proj.forward(x).chunk(2, 2);
        let res = halves.pop().unwrap();
        let x = halves.pop().unwrap();

        // Depthwise causal conv; padding is trimmed back to the input length.
        let x = self.conv1d.forward(x.swap_dims(1, 2)).narrow(2, 0, len);
        let x = silu(x.swap_dims(1, 2));

        let y = self.ssm(x) * silu(res);
        self.out_proj.forward(y)
    }
}

/// Pre-norm residual wrapper: `x + mixer(norm(x))`.
#[derive(Module, Debug)]
struct ResidualBlock<B: Backend> {
    mixer: MambaBlock<B>,
    norm: RmsNorm<B>,
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.mixer.forward(self.norm.forward(x.clone())) + x
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MambaConfig {
    pub h: usize,
    pub input_size: usize,
    pub hidden_size: usize,
    pub expand_factor: usize,
    pub conv_kernel: usize,
    pub state_dim: usize,
    pub e_layers: usize,
    pub dropout: f64,
}

impl MambaConfig {
    pub fn new(h: usize, input_size: usize) -> Self {
        Self {
            h,
            input_size,
            hidden_size: 512,
            expand_factor: 2,
            conv_kernel: 32,
            state_dim: 2048,
            e_layers: 2,
            dropout: 0.05,
        }
    }

    #[must_use]
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    #[must_use]
    pub fn with_state_dim(mut self, state_dim: usize) -> Self {
        self.state_dim = state_dim;
        self
    }

    #[must_use]
    pub fn with_conv_kernel(mut self, conv_kernel: usize) -> Self {
        self.conv_kernel = conv_kernel;
        self
    }

    #[must_use]
    pub fn with_e_layers(mut self, e_layers: usize) -> Self {
        self.e_layers = e_layers;
        self
    }

    #[must_use]
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn init<B: Backend>(
        &self,
        output: &impl OutputAdapter<B>,
        device: &B::Device,
    ) -> Result<Mamba<B>, ModelError> {
        if self.input_size < self.h {
            return Err(ModelError::invalid(
                "input_size must be >= h, the forecast is read off the window tail",
            ));
        }
        if self.hidden_size == 0 || self.hidden_size % 2 != 0 {
            return Err(ModelError::invalid("hidden_size must be a positive even number"));
        }
        if self.expand_factor == 0 || self.state_dim == 0 || self.conv_kernel == 0 {
            return Err(ModelError::invalid(
                "expand_factor, state_dim and conv_kernel must be positive",
            ));
        }

        let d_inner = self.hidden_size * self.expand_factor;
        let dt_rank = self.hidden_size.div_ceil(16);
        debug!(d_inner, dt_rank, layers = self.e_layers, "building mamba stack");

        let layers = (0..self.e_layers)
            .map(|_| ResidualBlock {
                mixer: MambaBlock::new(
                    self.hidden_size,
                    d_inner,
                    dt_rank,
                    self.conv_kernel,
                    self.state_dim,
                    device,
                ),
                norm: RmsNorm::new(self.hidden_size, device),
            })
            .collect();

        Ok(Mamba {
            embedding: DataEmbedding::new(
                1,
                self.hidden_size,
                self.input_size,
                self.dropout,
                device,
            ),
            layers,
            norm: RmsNorm::new(self.hidden_size, device),
            out_layer: LinearConfig::new(self.hidden_size, output.outputsize_multiplier())
                .with_bias(false)
                .init(device),
            h: self.h,
        })
    }
}

#[derive(Module, Debug)]
pub struct Mamba<B: Backend> {
    embedding: DataEmbedding<B>,
    layers: Vec<ResidualBlock<B>>,
    norm: RmsNorm<B>,
    out_layer: Linear<B>,
    h: usize,
}

impl<B: Backend> Mamba<B> {
    /// `[batch, h, outputsize_multiplier]` forecast.
    pub fn forward(
        &self,
        batch: &WindowsBatch<B>,
        output: &impl OutputAdapter<B>,
    ) -> Tensor<B, 3> {
        let x_enc = batch.insample_y.clone();
        let len = x_enc.dims()[1];

        // Window standardization, inverted at the boundary. Statistics are
        // detached so gradients do not flow through them.
        let mean = x_enc.clone().mean_dim(1).detach();
        let centered = x_enc - mean.clone();
        let std = (centered.clone().var_bias(1) + 1e-5).sqrt().detach();
        let x = centered / std.clone();

        let mut x = self.embedding.forward(x);
        for layer in &self.layers {
            x = layer.forward(x);
        }
        let x = self.norm.forward(x);
        let x = self.out_layer.forward(x);

        let x = x * std + mean;
        let forecast = x.narrow(1, len - self.h, self.h);
        output.domain_map(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PointOutput;
    use burn::tensor::{Distribution, Tolerance};

    type TestBackend = burn::backend::NdArray;

    fn small_config() -> MambaConfig {
        MambaConfig::new(4, 16)
            .with_hidden_size(16)
            .with_state_dim(8)
            .with_conv_kernel(4)
            .with_e_layers(1)
    }

    #[test]
    fn forecast_shape() {
        let device = Default::default();
        let output = PointOutput;
        let model = small_config().init::<TestBackend>(&output, &device).unwrap();

        let y = Tensor::random([4, 16, 1], Distribution::Default, &device);
        let forecast = model.forward(&WindowsBatch::from_target(y), &output);
        assert_eq!(forecast.dims(), [4, 4, 1]);
    }

    #[test]
    fn rejects_window_shorter_than_horizon() {
        let device = Default::default();
        let err = MambaConfig::new(8, 4)
            .with_hidden_size(16)
            .init::<TestBackend>(&PointOutput, &device)
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig { .. }));
    }

    #[test]
    fn rms_norm_preserves_shape_and_scale_invariance() {
        let device = Default::default();
        let norm = RmsNorm::<TestBackend>::new(8, &device);
        let x = Tensor::<TestBackend, 3>::random([2, 5, 8], Distribution::Default, &device);

        let y = norm.forward(x.clone());
        let y_scaled = norm.forward(x * 10.0);
        // Exact invariance would need eps = 0; the eps term leaves an
        // error of order eps relative to the activations.
        y.into_data()
            .assert_approx_eq::<f32>(&y_scaled.into_data(), Tolerance::rel_abs(1e-3, 1e-4));
    }
}
