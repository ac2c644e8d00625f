//! Keeps Mammotion Luba mowers in sync over Bluetooth LE.
//!
//! A [`coordinator::Coordinator`] polls one mower, serializing and coalescing
//! refreshes and classifying transport failures. [`activity::derive_activity`]
//! turns the raw report into a user-facing [`activity::ActivityState`], and
//! [`mower::LawnMower`] issues start/pause/dock commands consistent with it.

pub mod activity;
pub mod btle;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod messages;
pub mod mower;
pub mod poller;
pub mod session;
pub mod state;

#[cfg(test)]
mod mock;
