//! Engine scenarios.
//!
//! - `harness.rs`   - mock transport, mock authenticator, engine builder
//! - `ordering.rs`  - dependency gating, session and connectivity gates
//! - `failures.rs`  - gateway retries, backoff, retry bound, permanent errors
//! - `auth.rs`      - token expiry, replay, logout and rejected credentials
//! - `durability.rs`- restart recovery, missing or failing storage, shutdown
//! - `claims.rs`    - exactly-once dispatch across instances, orphan adoption
//! - `channel.rs`   - persistent channel availability and reply correlation

mod failures;
