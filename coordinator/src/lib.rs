//! Best-effort unit-of-work coordination across heterogeneous backends.
//!
//! Business logic opens one unit of work through a [`CompositeTransactor`]
//! and threads the returned [`Context`] through its calls. Adapter clients
//! find their open transaction in that context, so a PostgreSQL write and a
//! broker publish made under it are committed or rolled back together.
//!
//! Finalization is fan-out, not two-phase commit: when one backend commits
//! and another fails, the committed side stays committed and the caller
//! receives every failure.
//!
//! [`CompositeTransactor`]: domain::CompositeTransactor
//! [`Context`]: domain::Context

pub mod config;
pub mod domain;
pub mod outbound;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
