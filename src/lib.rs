#![cfg_attr(not(test), no_std)]

//! Connection Event Prepare Callbacks for nRF BLE Controllers
//!
//! Lets the application run a callback a fixed lead time before every
//! connection event of a BLE link, organized in layers:
//!
//! - `core`: routing channel pool and hardware seams
//! - `ble`: connection registry, lifecycle events, trigger installation and
//!   the prepare engine
//! - `nrf`: nRF52840 backend (EGU, TIMER, PPI, SoftDevice Controller)

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod ble;
pub mod core;
#[cfg(feature = "nrf52840")]
pub mod nrf;

pub use crate::ble::connection::{ConnRef, ConnectionEvent, ConnectionParams, Role};
pub use crate::ble::prepare::{ConnEvtPrepare, PrepareCallback, PrepareError, UserData};
