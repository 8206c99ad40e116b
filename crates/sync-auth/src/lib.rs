//! Session and authentication for the sync core.
//!
//! [`SessionManager`] drives an explicit state machine ([`session_fsm`])
//! through the connectivity and credential challenge, caches the issued
//! session in the durable store, and handles token expiry by moving to
//! `Deauthenticated` and running the challenge again.

mod authenticator;
mod cache;
mod error;
pub mod session_fsm;
mod session;

pub use authenticator::{Authenticator, HttpAuthenticator, IdentityProvider, SessionGrant};
pub use cache::{CachedSession, SessionCache};
pub use error::{AuthError, AuthResult};
pub use session::{Session, SessionManager};
pub use session_fsm::{
    RefreshConfig, SessionMachine, SessionMachineInput, SessionMachineState, SessionState,
};
