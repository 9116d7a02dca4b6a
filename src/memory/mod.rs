//! Arena allocator hierarchy (spec §3, §4.A-C, §4.F).
//!
//! Reserved virtual memory, incrementally committed pages, thread-local and
//! shared lock-free bump pointers, and a generational two-slot arena pool
//! recycled through the [`crate::concurrent::freelist`].

pub mod bump;
pub mod commit;
pub mod pool;
pub mod reserve;
