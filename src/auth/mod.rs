//! Authentication for both wire surfaces.
//!
//! Bearer JWTs carry `{sub, game_id, exp, scopes}`. The guard validates the
//! token and injects the resulting [`Identity`] into the request envelope;
//! public routes (health, login, register) bypass it only through their
//! explicit allow-list flag on the route table, never by inference.

mod jwt;

pub use jwt::{extract_token_from_header, Claims, Identity, JwtValidator};
