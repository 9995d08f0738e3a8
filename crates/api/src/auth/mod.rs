//! Session and credential lifecycle

pub mod clock;
pub mod events;
pub mod jwt;
pub mod login_attempts;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod password;
pub mod service;
pub mod sessions;
pub mod store;
pub mod users;

pub use jwt::{Claims, JwtManager, TokenType};
pub use login_attempts::{AttemptKey, AttemptOutcome, LoginAttemptTracker, LoginThrottleConfig};
pub use middleware::{require_admin, require_auth, AuthState, AuthUser};
pub use password::{validate_password_strength, Argon2Hasher};
pub use service::{AuthResponse, AuthService, LoginInput, RegisterInput, TokenPair};
pub use sessions::{RevocationReason, SessionContext, SessionManager};
