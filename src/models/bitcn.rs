//! Bidirectional temporal convolutional forecaster.
//!
//! Two dilated convolution stacks: a backward (causal) stack over the
//! lookback window and, when future covariates exist, a forward
//! (anti-causal) stack over lookback + horizon. Cells thread a
//! (hidden, accumulated output) carry pair and accumulate residually.

use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig1d};
use burn::prelude::*;
use burn::tensor::activation::gelu;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::WindowsBatch;
use crate::error::ModelError;
use crate::output::OutputAdapter;

/// Which side of the window a cell may look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Left padding only: position t sees inputs <= t.
    Backward,
    /// Right padding only: position t sees inputs >= t.
    Forward,
}

/// 1-D convolution with asymmetric zero padding.
#[derive(Module, Debug)]
pub struct CausalConv1d<B: Backend> {
    conv: Conv1d<B>,
    pad_left: usize,
    pad_right: usize,
}

impl<B: Backend> CausalConv1d<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        dilation: usize,
        direction: Direction,
        device: &B::Device,
    ) -> Self {
        let conv = Conv1dConfig::new(in_channels, out_channels, kernel_size)
            .with_dilation(dilation)
            .with_padding(PaddingConfig1d::Valid)
            .init(device);
        let (pad_left, pad_right) = match direction {
            Direction::Backward => (padding, 0),
            Direction::Forward => (0, padding),
        };
        Self {
            conv,
            pad_left,
            pad_right,
        }
    }

    /// `x`: `[batch, channels, time]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.pad((self.pad_left, self.pad_right, 0, 0), 0.0);
        self.conv.forward(x)
    }
}

/// One dilated cell: conv -> GELU -> dropout -> 1x1 conv doubling the
/// channel width, split into deltas for the (hidden, output) carry.
#[derive(Module, Debug)]
pub struct TcnCell<B: Backend> {
    conv1: CausalConv1d<B>,
    conv2: Conv1d<B>,
    drop: Dropout,
}

impl<B: Backend> TcnCell<B> {
    pub fn new(
        channels: usize,
        kernel_size: usize,
        dilation: usize,
        direction: Direction,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel_size - 1) * dilation;
        Self {
            conv1: CausalConv1d::new(
                channels, channels, kernel_size, padding, dilation, direction, device,
            ),
            conv2: Conv1dConfig::new(channels, channels * 2, 1).init(device),
            drop: DropoutConfig::new(dropout).init(),
        }
    }

    /// Returns the carry with both halves residually accumulated.
    pub fn forward(
        &self,
        hidden: Tensor<B, 3>,
        output: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let h = self.drop.forward(gelu(self.conv1.forward(hidden.clone())));
        let mut halves = self.conv2.forward(h).chunk(2, 1);
        let output_delta = halves.pop().unwrap();
        let hidden_delta = halves.pop().unwrap();
        (hidden + hidden_delta, output + output_delta)
    }
}

/// Number of dilated layers needed for a receptive field covering `span`.
pub fn required_layers(span: usize, kernel_size: usize) -> usize {
    let ratio = (span - 1) as f64 / (kernel_size - 1) as f64;
    (ratio + 1.0).log2().ceil() as usize
}

fn stack<B: Backend>(
    span: usize,
    channels: usize,
    kernel_size: usize,
    direction: Direction,
    dropout: f64,
    device: &B::Device,
) -> Vec<TcnCell<B>> {
    (0..required_layers(span, kernel_size))
        .map(|i| TcnCell::new(channels, kernel_size, 1 << i, direction, dropout, device))
        .collect()
}

fn run_stack<B: Backend>(cells: &[TcnCell<B>], x: Tensor<B, 3>) -> Tensor<B, 3> {
    let output = Tensor::zeros(x.dims(), &x.device());
    let (_, output) = cells
        .iter()
        .fold((x, output), |(h, o), cell| cell.forward(h, o));
    output
}

#[derive(Module, Debug)]
struct FutureBranch<B: Backend> {
    lin: Linear<B>,
    drop: Dropout,
    net: Vec<TcnCell<B>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiTcnConfig {
    pub h: usize,
    pub input_size: usize,
    pub hidden_size: usize,
    pub dropout: f64,
    pub hist_exog_size: usize,
    pub futr_exog_size: usize,
    pub stat_exog_size: usize,
}

impl BiTcnConfig {
    pub fn new(h: usize, input_size: usize) -> Self {
        Self {
            h,
            input_size,
            hidden_size: 16,
            dropout: 0.5,
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
    ) -> Result<BiTcn<B>, ModelError> {
        if self.h == 0 || self.input_size == 0 {
            return Err(ModelError::invalid("h and input_size must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::invalid("dropout must be in [0, 1)"));
        }

        // Kernel size is fixed at 2; depth follows from the receptive field.
        let kernel_size = 2;
        let hidden = self.hidden_size;
        let n_layers_bwd = required_layers(self.input_size, kernel_size);
        debug!(n_layers_bwd, "building backward TCN stack");

        let in_features = 1 + self.hist_exog_size + self.stat_exog_size + self.futr_exog_size;
        let lin_hist = LinearConfig::new(in_features, hidden).init(device);
        let net_bwd = stack(
            self.input_size,
            hidden,
            kernel_size,
            Direction::Backward,
            self.dropout,
            device,
        );

        let mut output_width_multiplier = 1;
        let futr = if self.futr_exog_size > 0 {
            output_width_multiplier += 2;
            let span = self.input_size + self.h;
            debug!(
                n_layers_fwd = required_layers(span, kernel_size),
                "building forward TCN stack"
            );
            Some(FutureBranch {
                lin: LinearConfig::new(self.futr_exog_size, hidden).init(device),
                drop: DropoutConfig::new(self.dropout).init(),
                net: stack(
                    span,
                    hidden,
                    kernel_size,
                    Direction::Forward,
                    self.dropout,
                    device,
                ),
            })
        } else {
            None
        };

        Ok(BiTcn {
            lin_hist,
            drop_hist: DropoutConfig::new(self.dropout).init(),
            net_bwd,
            futr,
            drop_temporal: DropoutConfig::new(self.dropout).init(),
            temporal_lin1: LinearConfig::new(self.input_size, hidden).init(device),
            temporal_lin2: LinearConfig::new(hidden, self.h).init(device),
            output_lin: LinearConfig::new(
                output_width_multiplier * hidden,
                output.outputsize_multiplier(),
            )
            .init(device),
            hist_exog_size: self.hist_exog_size,
            stat_exog_size: self.stat_exog_size,
        })
    }
}

#[derive(Module, Debug)]
pub struct BiTcn<B: Backend> {
    lin_hist: Linear<B>,
    drop_hist: Dropout,
    net_bwd: Vec<TcnCell<B>>,
    futr: Option<FutureBranch<B>>,
    drop_temporal: Dropout,
    temporal_lin1: Linear<B>,
    temporal_lin2: Linear<B>,
    output_lin: Linear<B>,
    hist_exog_size: usize,
    stat_exog_size: usize,
}

impl<B: Backend> BiTcn<B> {
    /// `[batch, h, outputsize_multiplier]` forecast.
    pub fn forward(
        &self,
        batch: &WindowsBatch<B>,
        output: &impl OutputAdapter<B>,
    ) -> Tensor<B, 3> {
        let mut x = batch.insample_y.clone();
        let [_, seq_len, _] = x.dims();

        if self.hist_exog_size > 0 {
            let hist = batch.hist_exog.clone().expect("hist_exog configured but missing");
            x = Tensor::cat(vec![x, hist], 2);
        }
        if self.stat_exog_size > 0 {
            let stat = batch.stat_exog.clone().expect("stat_exog configured but missing");
            let stat = stat.unsqueeze_dim::<3>(1).repeat_dim(1, seq_len);
            x = Tensor::cat(vec![x, stat], 2);
        }

        // Future branch encodes the full lookback + horizon span, then is
        // split into its past and future halves.
        let mut futr_split = None;
        if let Some(branch) = &self.futr {
            let futr = batch.futr_exog.clone().expect("futr_exog configured but missing");
            x = Tensor::cat(vec![x, futr.clone().narrow(1, 0, seq_len)], 2);

            let xf = branch.drop.forward(branch.lin.forward(futr));
            let xf = run_stack(&branch.net, xf.swap_dims(1, 2));
            let span = xf.dims()[2];
            futr_split = Some((
                xf.clone().narrow(2, 0, seq_len),
                xf.narrow(2, seq_len, span - seq_len),
            ));
        }

        // Backward stack over the lookback window.
        let x = self.drop_hist.forward(self.lin_hist.forward(x));
        let mut x = run_stack(&self.net_bwd, x.swap_dims(1, 2));

        if let Some((futr_past, _)) = &futr_split {
            x = Tensor::cat(vec![x, futr_past.clone()], 1);
        }

        // Temporal dense layers map the lookback axis onto the horizon.
        let x = self.drop_temporal.forward(gelu(self.temporal_lin1.forward(x)));
        let mut x = self.temporal_lin2.forward(x);

        if let Some((_, futr_future)) = futr_split {
            x = Tensor::cat(vec![x, futr_future], 1);
        }

        let forecast = self.output_lin.forward(x.swap_dims(1, 2));
        output.domain_map(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PointOutput;
    use burn::tensor::{Distribution, Tolerance};

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn layer_count_brackets_receptive_field() {
        let kernel = 2;
        for n in [2usize, 3, 5, 16, 17, 100] {
            let layers = required_layers(n, kernel);
            let ratio = (n - 1) / (kernel - 1);
            assert!(
                (1 << (layers - 1)) <= ratio && ratio < (1 << layers),
                "n={n}: 2^{} <= {ratio} < 2^{layers} violated",
                layers - 1
            );
        }
    }

    #[test]
    fn backward_cell_ignores_the_future() {
        let device = Default::default();
        let conv = CausalConv1d::<TestBackend>::new(1, 1, 2, 2, 2, Direction::Backward, &device);

        let len = 12;
        let zeroed_tail = 4;
        let x = Tensor::<TestBackend, 3>::random([1, 1, len], Distribution::Default, &device);
        let x_cut = x.clone().narrow(2, 0, len - zeroed_tail).pad((0, zeroed_tail, 0, 0), 0.0);

        let y = conv.forward(x).narrow(2, 0, len - zeroed_tail);
        let y_cut = conv.forward(x_cut).narrow(2, 0, len - zeroed_tail);
        y.into_data()
            .assert_approx_eq::<f32>(&y_cut.into_data(), Tolerance::default());
    }

    #[test]
    fn forward_cell_ignores_the_past() {
        let device = Default::default();
        let conv = CausalConv1d::<TestBackend>::new(1, 1, 2, 2, 2, Direction::Forward, &device);

        let len = 12;
        let zeroed_head = 4;
        let x = Tensor::<TestBackend, 3>::random([1, 1, len], Distribution::Default, &device);
        let x_cut = x.clone().narrow(2, zeroed_head, len - zeroed_head).pad((zeroed_head, 0, 0, 0), 0.0);

        let y = conv.forward(x).narrow(2, zeroed_head, len - zeroed_head);
        let y_cut = conv.forward(x_cut).narrow(2, zeroed_head, len - zeroed_head);
        y.into_data()
            .assert_approx_eq::<f32>(&y_cut.into_data(), Tolerance::default());
    }

    #[test]
    fn forecast_shape_with_and_without_exog() {
        let device = Default::default();
        let output = PointOutput;
        let (batch, lookback, h) = (4, 16, 4);

        for (hist, futr, stat) in [(0, 0, 0), (3, 2, 5)] {
            let model = BiTcnConfig::new(h, lookback)
                .with_hidden_size(8)
                .with_exog(hist, futr, stat)
                .init::<TestBackend>(&output, &device)
                .unwrap();

            let windows = WindowsBatch {
                insample_y: Tensor::random([batch, lookback, 1], Distribution::Default, &device),
                insample_mask: Tensor::ones([batch, lookback], &device),
                hist_exog: (hist > 0)
                    .then(|| Tensor::random([batch, lookback, hist], Distribution::Default, &device)),
                futr_exog: (futr > 0).then(|| {
                    Tensor::random([batch, lookback + h, futr], Distribution::Default, &device)
                }),
                stat_exog: (stat > 0)
                    .then(|| Tensor::random([batch, stat], Distribution::Default, &device)),
            };

            let forecast = model.forward(&windows, &output);
            assert_eq!(forecast.dims(), [batch, h, 1]);
        }
    }
}
