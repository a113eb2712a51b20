pub mod credentials;
pub mod keys;
pub mod oauth;
pub mod rate_limit;

pub use credentials::{Credential, CredentialResolver};
pub use keys::{GeneratedKey, KeyResolver, ResolvedKey, generate_key};
pub use oauth::OAuthManager;
pub use rate_limit::RateLimiter;
