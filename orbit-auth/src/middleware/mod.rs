pub mod auth;
pub mod metrics;
pub mod tenant;

pub use auth::{auth_middleware, bearer_token, AuthUser};
pub use metrics::metrics_middleware;
pub use tenant::{OrbitId, ORBIT_HEADER};
