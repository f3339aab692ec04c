pub mod access_token;
pub mod auth_code;
pub mod client;
pub mod consent;
pub mod orbit;
pub mod refresh_token;
pub mod revoked_token;
pub mod role;
pub mod session;
pub mod signing_key;
pub mod user;

pub use access_token::AccessTokenRecord;
pub use auth_code::AuthCode;
pub use client::{Client, GrantType, TokenEndpointAuthMethod};
pub use consent::Consent;
pub use orbit::Orbit;
pub use refresh_token::RefreshToken;
pub use revoked_token::{RevokedToken, TokenKind};
pub use role::Role;
pub use session::{Session, SessionState};
pub use signing_key::SigningKey;
pub use user::{normalize_email, SanitizedUser, User};
