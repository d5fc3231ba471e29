// Trial enforcement module
// Per-device evaluation period for unauthenticated users

pub mod types;
pub mod config;
pub mod fingerprint;
pub mod storage;
pub mod clock;
pub mod api;
pub mod manager;

pub use types::*;
pub use config::*;
pub use fingerprint::{Fingerprint, FingerprintGenerator};
pub use manager::TrialController;
