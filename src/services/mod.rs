//! Routing and health management.
//!
//! Health tracking, provider weighting and selection, group resolution and
//! the per-request gateway orchestrator.

pub mod gateway;
pub mod group_resolver;
pub mod health_store;
pub mod provider_selector;
pub mod weight;

// Re-export commonly used types
pub use gateway::{Gateway, GatewayRequest, ProxiedResponse};
pub use group_resolver::GroupResolver;
pub use health_store::HealthStore;
pub use provider_selector::{pick_weighted, Candidate, ProviderSelector, SelectionError};
pub use weight::calculate_weight;
