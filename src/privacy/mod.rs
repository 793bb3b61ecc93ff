//! Differential Privacy Module
//!
//! DP-SGD following Abadi et al. (2016): per-example gradients captured by
//! backward hooks, global-norm clipping, Gaussian noise, and a Rényi DP ledger.
//!
//! # Example
//!
//! ```
//! use entrenar_privacy::privacy::{PrivacyBudget, PrivacyConfig};
//!
//! let config = PrivacyConfig::new(64, 60_000)
//!     .with_max_grad_norm(1.0)
//!     .with_noise_multiplier(1.1)
//!     .with_budget(PrivacyBudget::new(8.0, 1e-5));
//! assert!(config.validate().is_ok());
//! ```
//!
//! # References
//!
//! \[1\] Abadi et al. (2016) - Deep Learning with Differential Privacy
//! \[2\] Mironov (2017) - Renyi Differential Privacy

pub mod accountant;
pub mod clip;
pub mod config;
pub mod engine;
pub mod grad_sample;
pub mod noise;
pub mod utils;
pub mod validator;


pub use accountant::{
    compute_rdp, compute_rdp_sampled_gaussian, rdp_to_dp, RdpAccountant, MAX_ORDER,
};
pub use clip::{clip_and_aggregate, ClipStats};
pub use config::{default_alphas, ClippingConfig, NoiseConfig, PrivacyBudget, PrivacyConfig};
pub use engine::{EngineState, PrivacyEngine, StepReport};
pub use grad_sample::{CaptureSession, GradSampleHook};
pub use noise::NoiseInjector;
pub use utils::{estimate_noise_multiplier, privacy_cost_per_step};
pub use validator::{convert_batch_norm, ModelValidator, Support, Violation};
