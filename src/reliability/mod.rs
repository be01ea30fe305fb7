//! Keeps the scheduler functioning while backends degrade: circuit
//! breaking, health probing, fallback chains, and graceful degradation.

pub mod breaker;
pub mod degradation;
pub mod fallback;
pub mod health;

pub use breaker::{CircuitBreaker, CircuitState};
pub use degradation::{DegradationAction, DegradationManager};
pub use fallback::FallbackManager;
pub use health::HealthChecker;
