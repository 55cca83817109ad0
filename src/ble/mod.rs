//! BLE Connection Event Prepare
//!
//! Connection tracking, lifecycle fan-out, controller trigger installation
//! and the prepare callback engine built on top of them.

pub mod connection;
pub mod events;
pub mod prepare;
pub mod trigger;
