//! Worker-affine channel sessions.
//!
//! Each worker owns at most one open [`ChannelSession`] at a time. Instead of
//! thread-local state, sessions live in a [`SessionPool`] keyed by
//! [`WorkerId`], and the worker identity travels with the
//! [`TransactionContext`](crate::TransactionContext) of each unit of work.
//!
//! # Session Lifecycle
//!
//! ```text
//!  acquire ──► open channel ──► tx_select ──► basic_qos ──► declare ──► replay
//!                                                                        │
//!            ┌───────────────────────────────────────────────────────────┘
//!            ▼
//!      ┌───────────┐  end-of-stream / closed   ┌───────────┐
//!      │   Open    ├──────────────────────────►│ Discarded │
//!      │ (pooled)  │                           │           │
//!      └───────────┘                           └─────┬─────┘
//!            ▲              next acquire             │
//!            └───────────────────────────────────────┘
//! ```
//!
//! A discarded session is never reused or repaired; the next acquire builds
//! a new one on the current connection.

/// Channel session and its transactional hooks
pub mod channel;

/// Session pool and worker identity
pub mod pool;

pub use channel::{ChannelSession, NextDelivery};
pub use pool::{SessionPool, WorkerId};
