//! Background Tasks Module
//!
//! - Expiry sweeper: reclaims expired keys of the in-memory store

mod sweeper;

pub use sweeper::spawn_sweeper;
