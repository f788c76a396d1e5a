//! Certificate trust: identity extraction, caller policy and the engine
//! combining both with chain verification.

pub mod engine;
pub mod identity;
pub mod policy;

pub use engine::TrustEngine;
pub use identity::CertIdentity;
pub use policy::CallerPolicy;
