//! # Kernel synchronization primitives
//!
//! Spin-based locks for code that runs with a raised interrupt priority and
//! must never sleep:
//!
//! - [`SpinLock`]: exclusive TATAS lock.
//! - [`RwSpinLock`]: writer-preferring reader/writer lock.
//! - [`LockBits`]: a packed array of one-bit locks.
//! - [`SplGuard`]: scoped interrupt priority, see [`spl`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod lock_bits;
mod rw_lock;
pub mod spl;
mod spin_lock;

pub use lock_bits::{LockBitGuard, LockBits};
pub use rw_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use spl::{InterruptPriority, Spl, SplGuard};
