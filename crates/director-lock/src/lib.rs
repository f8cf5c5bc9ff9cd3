//! director-lock — named, leased, renewable locks.
//!
//! Every mutating job takes a lock before touching shared state: one per
//! deployment, release, stemcell or compile slot. Names follow
//! `lock:<type>:<resource...>`.

pub mod error;
pub mod manager;
pub mod name;

pub use error::{LockError, LockResult};
pub use manager::{run_sweeper, HeldLock, Lease, LockConfig, LockInfo, LockManager};
pub use name::*;
