//! Entrenar Privacy: differentially private training
//!
//! DP-SGD in the style of Abadi et al. (2016), layered on top of a training
//! loop that owns the forward/backward computation:
//!
//! - **Per-example gradients**: backward hooks reconstruct one gradient per
//!   training example from saved activations and output gradients.
//! - **Clipping**: each example's gradient is bounded by a global norm taken
//!   across the whole model.
//! - **Noise**: calibrated Gaussian noise is added to the clipped aggregate.
//! - **Accounting**: a Rényi DP ledger composes the per-step cost and converts
//!   it to an `(epsilon, delta)` guarantee on demand.
//!
//! # Example
//!
//! ```
//! use entrenar_privacy::nn::{cross_entropy, Linear, Module, Sequential};
//! use entrenar_privacy::optim::{Optimizer, SGD};
//! use entrenar_privacy::privacy::{PrivacyConfig, PrivacyEngine};
//! use ndarray::{ArrayD, IxDyn};
//!
//! # fn main() -> entrenar_privacy::Result<()> {
//! let mut model = Sequential::new().add("fc", Linear::new(4, 3, true));
//! let mut sgd = SGD::new(0.1, 0.0);
//!
//! let config = PrivacyConfig::new(8, 64)
//!     .with_noise_multiplier(1.1)
//!     .with_max_grad_norm(1.0);
//! let mut engine = PrivacyEngine::new(config)?;
//! engine.attach(&mut model)?;
//!
//! let x = ArrayD::from_elem(IxDyn(&[8, 4]), 0.5);
//! let targets = vec![0, 1, 2, 0, 1, 2, 0, 1];
//!
//! let logits = model.forward(&x)?;
//! let (_loss, grad) = cross_entropy(&logits, &targets)?;
//! model.backprop(&grad)?;
//!
//! let mut private = engine.wrap(&mut sgd)?;
//! private.step(&mut model.parameters_mut())?;
//! drop(private);
//!
//! let (epsilon, alpha) = engine.get_privacy_spent(1e-5)?;
//! assert!(epsilon > 0.0 && alpha > 1.0);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! \[1\] Abadi et al. (2016) - Deep Learning with Differential Privacy
//! \[2\] Mironov (2017) - Renyi Differential Privacy
//! \[3\] Mironov, Talwar, Zhang (2019) - Rényi Differential Privacy of the
//! Sampled Gaussian Mechanism

pub mod error;
pub mod nn;
pub mod optim;
pub mod privacy;

pub use error::{Error, Result};
pub use nn::{Module, Parameter, Sequential};
pub use optim::{Optimizer, PrivateOptimizer, SGD};
pub use privacy::{PrivacyConfig, PrivacyEngine};
