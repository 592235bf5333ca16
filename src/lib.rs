//! SSP operator: controllers gated on the presence of optional CRDs
//!
//! The operator watches the CustomResourceDefinitions its controllers depend
//! on. Controllers whose CRDs are missing stay inactive, and the process
//! exits to be restarted whenever CRD availability changes.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};
