pub mod auth;
pub mod client;
pub mod metrics;
pub mod oauth;
pub mod orbit;
pub mod user;
pub mod well_known;

pub use auth::{list_sessions, login, logout, refresh};
pub use client::{register_client, rotate_client_secret};
pub use oauth::{authorize, introspect, revoke, token, userinfo, OAuthError};
pub use orbit::create_orbit;
pub use user::register_user;
