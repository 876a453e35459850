//! Forward-computation cores for neural time-series forecasting.
//!
//! Five window-based architectures built on [burn], sharing a common batch
//! layout, output adapters and normalization primitives. Each model takes a
//! [`batch::WindowsBatch`] of lookback windows plus optional exogenous
//! features and produces a `[batch, horizon, width]` forecast, where the
//! width comes from the configured [`output::OutputAdapter`].

pub mod activation;
pub mod basis;
pub mod batch;
pub mod error;
pub mod models;
pub mod output;
pub mod revin;
pub mod scan;

pub use activation::Activation;
pub use batch::WindowsBatch;
pub use error::ModelError;
pub use output::{OutputAdapter, PointOutput, QuantileOutput};
