//! Outbound adapters implementing domain ports for external infrastructure.
//!
//! Each adapter pairs a transactor with the client that writes through it:
//!
//! - **persistence**: PostgreSQL transactions via Diesel and `bb8` pooling
//! - **broker**: buffered pseudo-transactions over a message producer
//!
//! Adapters are thin translators between domain types and
//! infrastructure-specific representations. They contain no business logic,
//! and they never import each other.

pub mod broker;
pub mod persistence;
