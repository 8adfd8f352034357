//! Stateful services built on the crypto primitives and stores.

pub mod loyalty;
pub mod mfa;
pub mod rate_limit;
