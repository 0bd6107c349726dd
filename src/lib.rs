//! Parameter and module primitives for a small neural-network toolkit.
//!
//! A [`Parameter`] owns an array and an `f32` gradient buffer of the same
//! shape. A [`Module`] runs `forward`/`backward` pairs keyed by micro-batch
//! id, accumulates parameter gradients and carries a training/evaluation
//! [`Mode`]. The layers in [`layer`] are small concrete modules built on
//! that contract.
pub mod cache;
pub mod error;
pub mod layer;
pub mod module;
pub mod parameter;

pub use cache::{ActivationCache, MicroBatchId, DEFAULT_MUBATCH};
pub use error::{Error, Result};
pub use layer::{Dropout, Linear, LinearConfig, ReLU, Sequential};
pub use module::{Mode, Module, ModuleBase};
pub use parameter::Parameter;
