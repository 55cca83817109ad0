//! Core System Infrastructure
//!
//! Platform-neutral building blocks that are not BLE-specific: the routing
//! channel pool and the hardware seams the prepare engine drives.

pub mod channels;
pub mod hal;
