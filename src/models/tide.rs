//! Dense encoder-decoder forecaster.
//!
//! Everything is flattened and pushed through stacked residual MLPs: an
//! encoder to a latent, a decoder to a per-step tensor, a temporal decoder
//! fusing future covariates per horizon step, and a global linear skip from
//! the raw lookback straight to the forecast.

use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::WindowsBatch;
use crate::error::ModelError;
use crate::output::OutputAdapter;

/// Two-layer MLP with a linear skip and optional layer norm on the sum.
#[derive(Module, Debug)]
pub struct MlpResidual<B: Backend> {
    lin1: Linear<B>,
    lin2: Linear<B>,
    skip: Linear<B>,
    drop: Dropout,
    norm: Option<LayerNorm<B>>,
}

impl<B: Backend> MlpResidual<B> {
    pub fn new(
        input_dim: usize,
        hidden_size: usize,
        output_dim: usize,
        dropout: f64,
        layernorm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            lin1: LinearConfig::new(input_dim, hidden_size).init(device),
            lin2: LinearConfig::new(hidden_size, output_dim).init(device),
            skip: LinearConfig::new(input_dim, output_dim).init(device),
            drop: DropoutConfig::new(dropout).init(),
            norm: layernorm.then(|| LayerNormConfig::new(output_dim).init(device)),
        }
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let x = relu(self.lin1.forward(input.clone()));
        let x = self.drop.forward(self.lin2.forward(x));
        let x = x + self.skip.forward(input);
        match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TideConfig {
    pub h: usize,
    pub input_size: usize,
    pub hidden_size: usize,
    pub decoder_output_dim: usize,
    pub temporal_decoder_dim: usize,
    pub dropout: f64,
    pub layernorm: bool,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub temporal_width: usize,
    pub hist_exog_size: usize,
    pub futr_exog_size: usize,
    pub stat_exog_size: usize,
}

impl TideConfig {
    pub fn new(h: usize, input_size: usize) -> Self {
        Self {
            h,
            input_size,
            hidden_size: 512,
            decoder_output_dim: 32,
            temporal_decoder_dim: 128,
            dropout: 0.3,
            layernorm: true,
            num_encoder_layers: 1,
            num_decoder_layers: 1,
            temporal_width: 4,
            hist_exog_size: 0,
            futr_exog_size: 0,
            stat_exog_size: 0,
        }
    }

    #[must_use]
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    #[must_use]
    pub fn with_decoder_output_dim(mut self, decoder_output_dim: usize) -> Self {
        self.decoder_output_dim = decoder_output_dim;
        self
    }

    #[must_use]
    pub fn with_layers(mut self, encoder: usize, decoder: usize) -> Self {
        self.num_encoder_layers = encoder;
        self.num_decoder_layers = decoder;
        self
    }

    #[must_use]
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    #[must_use]
    pub fn with_exog(mut self, hist: usize, futr: usize, stat: usize) -> Self {
        self.hist_exog_size = hist;
        self.futr_exog_size = futr;
        self.stat_exog_size = stat;
        self
    }

    pub fn init<B: Backend>(
        &self,
        output: &impl OutputAdapter<B>,
        device: &B::Device,
    ) -> Result<Tide<B>, ModelError> {
        if self.h == 0 || self.input_size == 0 {
            return Err(ModelError::invalid("h and input_size must be positive"));
        }
        if self.num_encoder_layers == 0 || self.num_decoder_layers == 0 {
            return Err(ModelError::invalid("encoder and decoder need at least one layer"));
        }
        if self.temporal_width == 0 {
            return Err(ModelError::invalid("temporal_width must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::invalid("dropout must be in [0, 1)"));
        }

        let width = output.outputsize_multiplier();
        let projection = |input_dim: usize| {
            MlpResidual::new(
                input_dim,
                self.hidden_size,
                self.temporal_width,
                self.dropout,
                self.layernorm,
                device,
            )
        };
        let hist_proj = (self.hist_exog_size > 0).then(|| projection(self.hist_exog_size));
        let futr_proj = (self.futr_exog_size > 0).then(|| projection(self.futr_exog_size));

        let encoder_input = self.input_size
            + self.input_size * usize::from(self.hist_exog_size > 0) * self.temporal_width
            + (self.input_size + self.h)
                * usize::from(self.futr_exog_size > 0)
                * self.temporal_width
            + self.stat_exog_size;
        debug!(encoder_input, "building dense encoder");

        let encoder = (0..self.num_encoder_layers)
            .map(|i| {
                MlpResidual::new(
                    if i == 0 { encoder_input } else { self.hidden_size },
                    self.hidden_size,
                    self.hidden_size,
                    self.dropout,
                    self.layernorm,
                    device,
                )
            })
            .collect();

        let decoder_output = self.decoder_output_dim * self.h;
        let decoder = (0..self.num_decoder_layers)
            .map(|i| {
                MlpResidual::new(
                    self.hidden_size,
                    self.hidden_size,
                    if i == self.num_decoder_layers - 1 {
                        decoder_output
                    } else {
                        self.hidden_size
                    },
                    self.dropout,
                    self.layernorm,
                    device,
                )
            })
            .collect();

        let temporal_decoder = MlpResidual::new(
            self.decoder_output_dim
                + usize::from(self.futr_exog_size > 0) * self.temporal_width,
            self.temporal_decoder_dim,
            width,
            self.dropout,
            self.layernorm,
            device,
        );

        Ok(Tide {
            global_skip: LinearConfig::new(self.input_size, self.h * width).init(device),
            hist_proj,
            futr_proj,
            encoder,
            decoder,
            temporal_decoder,
            h: self.h,
            stat_exog_size: self.stat_exog_size,
        })
    }
}

#[derive(Module, Debug)]
pub struct Tide<B: Backend> {
    global_skip: Linear<B>,
    hist_proj: Option<MlpResidual<B>>,
    futr_proj: Option<MlpResidual<B>>,
    encoder: Vec<MlpResidual<B>>,
    decoder: Vec<MlpResidual<B>>,
    temporal_decoder: MlpResidual<B>,
    h: usize,
    stat_exog_size: usize,
}

impl<B: Backend> Tide<B> {
    /// `[batch, h, outputsize_multiplier]` forecast.
    pub fn forward(
        &self,
        batch: &WindowsBatch<B>,
        output: &impl OutputAdapter<B>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_len, _] = batch.insample_y.dims();
        let mut x = batch.insample_y.clone().reshape([batch_size, seq_len]);

        // Independent additive path straight from the window to the horizon.
        let skip = self
            .global_skip
            .forward(x.clone())
            .reshape([batch_size as i32, self.h as i32, -1]);

        if let Some(proj) = &self.hist_proj {
            let hist = batch.hist_exog.clone().expect("hist_exog configured but missing");
            let projected = proj.forward(hist);
            let [_, l, w] = projected.dims();
            x = Tensor::cat(vec![x, projected.reshape([batch_size, l * w])], 1);
        }

        let mut futr_projected = None;
        if let Some(proj) = &self.futr_proj {
            let futr = batch.futr_exog.clone().expect("futr_exog configured but missing");
            let projected = proj.forward(futr);
            let [_, l, w] = projected.dims();
            x = Tensor::cat(vec![x, projected.clone().reshape([batch_size, l * w])], 1);
            futr_projected = Some(projected);
        }

        if self.stat_exog_size > 0 {
            let stat = batch.stat_exog.clone().expect("stat_exog configured but missing");
            x = Tensor::cat(vec![x, stat], 1);
        }

        let mut x = x;
        for layer in &self.encoder {
            x = layer.forward(x);
        }
        for layer in &self.decoder {
            x = layer.forward(x);
        }
        let mut x = x.reshape([batch_size as i32, self.h as i32, -1]);

        if let Some(projected) = futr_projected {
            let futr_h = projected.narrow(1, seq_len, self.h);
            x = Tensor::cat(vec![x, futr_h], 2);
        }

        let forecast = self.temporal_decoder.forward(x) + skip;
        output.domain_map(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{PointOutput, QuantileOutput};
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray;

    fn small_config() -> TideConfig {
        TideConfig::new(4, 16)
            .with_hidden_size(32)
            .with_decoder_output_dim(8)
            .with_dropout(0.0)
    }

    fn batch_for(
        hist: usize,
        futr: usize,
        stat: usize,
        batch: usize,
        lookback: usize,
        h: usize,
    ) -> WindowsBatch<TestBackend> {
        let device = Default::default();
        WindowsBatch {
            insample_y: Tensor::random([batch, lookback, 1], Distribution::Default, &device),
            insample_mask: Tensor::ones([batch, lookback], &device),
            hist_exog: (hist > 0)
                .then(|| Tensor::random([batch, lookback, hist], Distribution::Default, &device)),
            futr_exog: (futr > 0)
                .then(|| Tensor::random([batch, lookback + h, futr], Distribution::Default, &device)),
            stat_exog: (stat > 0)
                .then(|| Tensor::random([batch, stat], Distribution::Default, &device)),
        }
    }

    #[test]
    fn forecast_shape_with_all_exog() {
        let device = Default::default();
        let output = PointOutput;
        let model = small_config()
            .with_exog(3, 2, 4)
            .init::<TestBackend>(&output, &device)
            .unwrap();

        let forecast = model.forward(&batch_for(3, 2, 4, 4, 16, 4), &output);
        assert_eq!(forecast.dims(), [4, 4, 1]);
    }

    #[test]
    fn exogenous_toggling_keeps_shape() {
        let device = Default::default();
        let output = PointOutput;

        let plain = small_config().init::<TestBackend>(&output, &device).unwrap();
        assert!(plain.hist_proj.is_none());
        let with_hist = small_config()
            .with_exog(3, 0, 0)
            .init::<TestBackend>(&output, &device)
            .unwrap();
        assert!(with_hist.hist_proj.is_some());

        let shape = plain.forward(&batch_for(0, 0, 0, 2, 16, 4), &output).dims();
        assert_eq!(shape, [2, 4, 1]);
        let shape = with_hist.forward(&batch_for(3, 0, 0, 2, 16, 4), &output).dims();
        assert_eq!(shape, [2, 4, 1]);
    }

    #[test]
    fn quantile_output_widens_the_forecast() {
        let device = Default::default();
        let output = QuantileOutput::new(vec![0.05, 0.5, 0.95]);
        let model = small_config().init::<TestBackend>(&output, &device).unwrap();

        let forecast = model.forward(&batch_for(0, 0, 0, 2, 16, 4), &output);
        assert_eq!(forecast.dims(), [2, 4, 3]);
    }
}
