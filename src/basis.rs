use std::f64::consts::PI;

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::ModelError;

/// Which fixed basis a projection applies.
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisKind {
    /// Raw slices of theta, reshaped.
    Identity,
    /// Polynomial trend: rows are powers 0..=degree of a normalized index.
    Trend,
    /// Fourier seasonality: cosine rows stacked over sine rows.
    Seasonality,
}

/// Fixed basis projection used by the basis-expansion blocks.
///
/// Carries precomputed, non-trainable basis matrices (absent for the
/// identity kind) and maps a coefficient vector `theta` to a
/// `(backcast, forecast)` pair: backcast `[batch, backcast_size]`, forecast
/// `[batch, forecast_size, out_features]`. The coefficient count expected by
/// each kind is exposed through [`Basis::n_theta`] so the producing layer
/// can be sized exactly.
#[derive(Module, Debug)]
pub struct Basis<B: Backend> {
    kind: BasisKind,
    backcast_basis: Option<Tensor<B, 2>>,
    forecast_basis: Option<Tensor<B, 2>>,
    backcast_size: usize,
    forecast_size: usize,
    out_features: usize,
}

fn matrix<B: Backend>(rows: Vec<Vec<f64>>, device: &B::Device) -> Tensor<B, 2> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    let flat: Vec<f32> = rows.into_iter().flatten().map(|v| v as f32).collect();
    Tensor::from_data(TensorData::new(flat, [n_rows, n_cols]), device)
}

impl<B: Backend> Basis<B> {
    pub fn identity(backcast_size: usize, forecast_size: usize, out_features: usize) -> Self {
        Self {
            kind: BasisKind::Identity,
            backcast_basis: None,
            forecast_basis: None,
            backcast_size,
            forecast_size,
            out_features,
        }
    }

    pub fn trend(
        degree: usize,
        backcast_size: usize,
        forecast_size: usize,
        out_features: usize,
        device: &B::Device,
    ) -> Self {
        let powers = |size: usize| -> Vec<Vec<f64>> {
            (0..=degree)
                .map(|p| {
                    (0..size)
                        .map(|t| (t as f64 / size as f64).powi(p as i32))
                        .collect()
                })
                .collect()
        };
        Self {
            kind: BasisKind::Trend,
            backcast_basis: Some(matrix(powers(backcast_size), device)),
            forecast_basis: Some(matrix(powers(forecast_size), device)),
            backcast_size,
            forecast_size,
            out_features,
        }
    }

    pub fn seasonality(
        harmonics: usize,
        backcast_size: usize,
        forecast_size: usize,
        out_features: usize,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        if harmonics == 0 {
            return Err(ModelError::invalid("seasonality needs harmonics >= 1"));
        }
        // Frequencies {0} followed by {harmonics, harmonics+1, ...} / harmonics,
        // up to (but excluding) harmonics * forecast_size / 2.
        let mut freqs = vec![0.0f64];
        let stop = harmonics as f64 / 2.0 * forecast_size as f64;
        let mut k = harmonics as f64;
        while k < stop {
            freqs.push(k / harmonics as f64);
            k += 1.0;
        }

        let template = |size: usize, sign: f64| -> Vec<Vec<f64>> {
            let grid = |f: f64, t: usize| sign * 2.0 * PI * (t as f64 / forecast_size as f64) * f;
            let cos_rows = freqs
                .iter()
                .map(|&f| (0..size).map(|t| grid(f, t).cos()).collect::<Vec<_>>());
            let sin_rows = freqs
                .iter()
                .map(|&f| (0..size).map(|t| grid(f, t).sin()).collect::<Vec<_>>());
            cos_rows.chain(sin_rows).collect()
        };

        Ok(Self {
            kind: BasisKind::Seasonality,
            backcast_basis: Some(matrix(template(backcast_size, -1.0), device)),
            forecast_basis: Some(matrix(template(forecast_size, 1.0), device)),
            backcast_size,
            forecast_size,
            out_features,
        })
    }

    pub fn kind(&self) -> BasisKind {
        self.kind
    }

    /// Coefficient count the producing projection must emit.
    pub fn n_theta(&self) -> usize {
        match self.kind {
            BasisKind::Identity => {
                self.backcast_size + self.out_features * self.forecast_size
            }
            BasisKind::Trend | BasisKind::Seasonality => {
                let forecast_basis = self
                    .forecast_basis
                    .as_ref()
                    .expect("trend/seasonality carry their basis matrices");
                (self.out_features + 1) * forecast_basis.dims()[0]
            }
        }
    }

    /// Split theta into backcast/forecast coefficients and apply the basis.
    pub fn project(&self, theta: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 3>) {
        let batch = theta.dims()[0];
        match self.kind {
            BasisKind::Identity => {
                let backcast = theta.clone().narrow(1, 0, self.backcast_size);
                let forecast = theta
                    .narrow(1, self.backcast_size, self.out_features * self.forecast_size)
                    .reshape([batch, self.forecast_size, self.out_features]);
                (backcast, forecast)
            }
            BasisKind::Trend | BasisKind::Seasonality => {
                let backcast_basis = self
                    .backcast_basis
                    .as_ref()
                    .expect("trend/seasonality carry their basis matrices");
                let forecast_basis = self
                    .forecast_basis
                    .as_ref()
                    .expect("trend/seasonality carry their basis matrices");

                let n_coef = forecast_basis.dims()[0];
                let backcast_theta = theta.clone().narrow(1, 0, n_coef);
                let forecast_theta = theta
                    .narrow(1, n_coef, n_coef * self.out_features)
                    .reshape([batch, n_coef, self.out_features]);

                // [B, P] x [P, L] -> [B, L]
                let backcast = backcast_theta.matmul(backcast_basis.clone());
                // [1, T, P] x [B, P, W] -> [B, T, W]
                let forecast = forecast_basis
                    .clone()
                    .transpose()
                    .unsqueeze::<3>()
                    .matmul(forecast_theta);
                (backcast, forecast)
            }
        }
    }
}
