//! Per-device evaluation period ("trial") enforcement.
//!
//! The host builds a [`TrialController`] once, calls
//! [`TrialController::on_route_change`] on every navigation and reads
//! [`TrialController::status`] or subscribes for updates. Everything else
//! (fingerprinting, two local storage tiers, the authority service) stays
//! behind the controller.

pub mod trial;

pub use trial::api::{AuthorityClient, TrialAuthority};
pub use trial::clock::{Clock, ManualClock, SystemClock};
pub use trial::storage::{LocalTrialStore, TrialStore};
pub use trial::{
    ExpiryReason, Fingerprint, FingerprintGenerator, RouteContext, TrialConfig, TrialController,
    TrialError, TrialEvent, TrialInfo, TrialStatus,
};
