//! Security scanner module
//!
//! Passive rules inspect recorded traffic, active plugins attack it.
//! Both report into the shared alert store.

pub mod active;
pub mod alerts;
pub mod passive;
pub mod policies;
