//! Isolated runtime environment
//!
//! Code runs inside a dedicated Python virtual environment that carries the
//! kernel packages. The environment is created once and reused.

pub mod provisioner;

pub use provisioner::{
    kernel_spec_name, ProvisionError, Provisioner, ProvisionerConfig, RuntimeEnvironment,
};
