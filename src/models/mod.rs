//! Forecasting model architectures.

pub mod bitcn;
pub mod mamba;
pub mod nbeatsx;
pub mod tide;
pub mod tsmixer;

pub use bitcn::{BiTcn, BiTcnConfig};
pub use mamba::{Mamba, MambaConfig};
pub use nbeatsx::{NBeatsX, NBeatsXConfig};
pub use tide::{Tide, TideConfig};
pub use tsmixer::{TsMixer, TsMixerConfig};
