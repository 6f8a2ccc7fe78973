//! Runtime installation and removal of third-party resource types

pub mod manager;
pub mod phase;

pub use manager::{InstalledThirdPartyResource, ThirdPartyManager};
pub use phase::{PhaseCell, ResourcePhase};
