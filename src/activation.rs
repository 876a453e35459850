use burn::prelude::*;
use burn::tensor::activation::{gelu, leaky_relu, relu, sigmoid, softplus};

use crate::error::ModelError;

pub const ACTIVATION_NAMES: &[&str] = &[
    "ReLU", "Softplus", "Tanh", "SELU", "LeakyReLU", "Sigmoid", "GELU",
];

const SELU_SCALE: f64 = 1.050_700_987_355_480_5;
const SELU_ALPHA: f64 = 1.673_263_242_354_377_2;

/// Closed set of stateless activations the MLP-based blocks may use.
///
/// Parsed from a configuration string at construction; an unknown name is a
/// hard error, never a silent default.
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Softplus,
    Tanh,
    Selu,
    LeakyRelu,
    Sigmoid,
    Gelu,
}

impl Activation {
    pub fn parse(name: &str) -> Result<Self, ModelError> {
        match name {
            "ReLU" => Ok(Activation::Relu),
            "Softplus" => Ok(Activation::Softplus),
            "Tanh" => Ok(Activation::Tanh),
            "SELU" => Ok(Activation::Selu),
            "LeakyReLU" => Ok(Activation::LeakyRelu),
            "Sigmoid" => Ok(Activation::Sigmoid),
            "GELU" => Ok(Activation::Gelu),
            _ => Err(ModelError::UnknownActivation {
                name: name.to_string(),
                expected: ACTIVATION_NAMES,
            }),
        }
    }

    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => relu(x),
            Activation::Softplus => softplus(x, 1.0),
            Activation::Tanh => x.tanh(),
            Activation::Selu => {
                // scale * (max(0, x) + alpha * (exp(min(0, x)) - 1))
                let pos = x.clone().clamp_min(0.0);
                let neg = (x.clamp_max(0.0).exp() - 1.0).mul_scalar(SELU_ALPHA);
                (pos + neg).mul_scalar(SELU_SCALE)
            }
            Activation::LeakyRelu => leaky_relu(x, 0.01),
            Activation::Sigmoid => sigmoid(x),
            Activation::Gelu => gelu(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn parse_known_names() {
        for name in ACTIVATION_NAMES {
            assert!(Activation::parse(name).is_ok(), "{name} should parse");
        }
    }

    #[test]
    fn parse_unknown_name_fails() {
        let err = Activation::parse("Swish").unwrap_err();
        assert!(matches!(err, ModelError::UnknownActivation { .. }));
    }

    #[test]
    fn selu_matches_reference_points() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.0, 1.0], &device);
        let y = Activation::Selu.forward(x);
        let y = y.into_data();
        let expected = [-1.111_330_7f32, 0.0, 1.050_701];
        for (got, want) in y.iter::<f32>().zip(expected) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }
}
