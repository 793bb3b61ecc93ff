//! Optimizers and the privacy-wrapped optimizer

mod optimizer;
mod private;
mod sgd;

pub use optimizer::Optimizer;
pub use private::PrivateOptimizer;
pub use sgd::SGD;
