//! Runs every architecture on the same univariate batch and checks the
//! forecast layout they all share.

use burn::prelude::*;
use burn::tensor::Distribution;
use timecast::models::{BiTcnConfig, MambaConfig, NBeatsXConfig, TideConfig, TsMixerConfig};
use timecast::{PointOutput, QuantileOutput, WindowsBatch};

type TestBackend = burn::backend::NdArray;

const BATCH: usize = 4;
const LOOKBACK: usize = 16;
const HORIZON: usize = 4;

fn univariate_batch() -> WindowsBatch<TestBackend> {
    let device = Default::default();
    WindowsBatch::from_target(Tensor::random(
        [BATCH, LOOKBACK, 1],
        Distribution::Normal(0.5, 1.5),
        &device,
    ))
}

#[test]
fn every_model_forecasts_the_same_layout() {
    let device = Default::default();
    let output = PointOutput;
    let windows = univariate_batch();
    let expected = [BATCH, HORIZON, 1];

    let bitcn = BiTcnConfig::new(HORIZON, LOOKBACK)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(bitcn.forward(&windows, &output).dims(), expected);

    let mamba = MambaConfig::new(HORIZON, LOOKBACK)
        .with_hidden_size(16)
        .with_state_dim(8)
        .with_conv_kernel(4)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(mamba.forward(&windows, &output).dims(), expected);

    let nbeatsx = NBeatsXConfig::new(HORIZON, LOOKBACK)
        .with_mlp_units(vec![[32, 32]; 3])
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(nbeatsx.forward(&windows, &output).dims(), expected);

    let tide = TideConfig::new(HORIZON, LOOKBACK)
        .with_hidden_size(32)
        .with_decoder_output_dim(8)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(tide.forward(&windows, &output).dims(), expected);

    let tsmixer = TsMixerConfig::new(HORIZON, LOOKBACK, 1)
        .with_ff_dim(8)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(tsmixer.forward(&windows, &output).dims(), expected);
}

#[test]
fn quantile_adapter_widens_every_model() {
    let device = Default::default();
    let output = QuantileOutput::new(vec![0.1, 0.5, 0.9]);
    let windows = univariate_batch();
    let expected = [BATCH, HORIZON, 3];

    let bitcn = BiTcnConfig::new(HORIZON, LOOKBACK)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(bitcn.forward(&windows, &output).dims(), expected);

    let tide = TideConfig::new(HORIZON, LOOKBACK)
        .with_hidden_size(32)
        .with_decoder_output_dim(8)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(tide.forward(&windows, &output).dims(), expected);

    let tsmixer = TsMixerConfig::new(HORIZON, LOOKBACK, 1)
        .with_ff_dim(8)
        .with_dropout(0.0)
        .init::<TestBackend>(&output, &device)
        .unwrap();
    assert_eq!(tsmixer.forward(&windows, &output).dims(), expected);
}
