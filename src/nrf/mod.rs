//! nRF52840 Backend
//!
//! Wires the prepare engine to the hardware:
//!
//! - software events on EGU3 (one trigger per connection slot),
//! - delay timers on TIMER2 (one compare channel per slot),
//! - routing channels from the PPI channels MPSL and the SoftDevice
//!   Controller leave free,
//! - trigger commands issued to the SoftDevice Controller.
//!
//! ```ignore
//! bind_interrupts!(struct PrepareIrqs {
//!     EGU3_SWI3 => nrf_conn_evt_prepare::nrf::EguInterruptHandler;
//!     TIMER2 => nrf_conn_evt_prepare::nrf::TimerInterruptHandler;
//! });
//!
//! let routing = nrf::RoutingPpi::new(p.PPI_CH0, p.PPI_CH1, p.PPI_CH2, p.PPI_CH3);
//! nrf::init(p.EGU3, p.TIMER2, routing, PrepareIrqs, &sdc)?;
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_nrf::interrupt::typelevel::{Binding, EGU3_SWI3, TIMER2};
use embassy_nrf::interrupt::Priority;
use embassy_nrf::{peripherals, Peri};
use nrf_sdc::SoftdeviceController;

use crate::ble::connection::{self, ConnRef, ConnectionError, ConnectionEvent, GlobalConnections, MAX_CONNECTIONS};
use crate::ble::events::{self, ConnectionCallbacks};
use crate::ble::prepare::{ConnEvtPrepare, PrepareCallback, PrepareError, UserData};
use crate::ble::trigger::{ConnEventTrigger, TriggerController, TriggerError};
use crate::core::channels::{ChannelAllocator, ChannelError, ChannelPool, RoutingChannel};
use crate::core::hal::{DelayTimers, EventInterrupts};

mod egu;
mod sdc;
mod timer;

pub use egu::InterruptHandler as EguInterruptHandler;
pub use sdc::SdcTrigger;
pub use timer::InterruptHandler as TimerInterruptHandler;

/// First PPI channel reserved for connection event routing.
///
/// PPI_CH17..PPI_CH31 belong to MPSL and the SoftDevice Controller.
pub const PREPARE_PPI_FIRST: u8 = 0;

/// Number of PPI channels reserved for connection event routing
pub const PREPARE_PPI_COUNT: u8 = MAX_CONNECTIONS as u8;

// `RoutingPpi` claims exactly PPI_CH0..PPI_CH3
const _: () = ::core::assert!(PREPARE_PPI_FIRST == 0 && PREPARE_PPI_COUNT == 4);

/// The PPI channels the routing pool hands out.
///
/// Taking the singletons keeps application code from programming a channel
/// that carries a live trigger route.
pub struct RoutingPpi {
    _ch0: Peri<'static, peripherals::PPI_CH0>,
    _ch1: Peri<'static, peripherals::PPI_CH1>,
    _ch2: Peri<'static, peripherals::PPI_CH2>,
    _ch3: Peri<'static, peripherals::PPI_CH3>,
}

impl RoutingPpi {
    pub fn new(
        ch0: Peri<'static, peripherals::PPI_CH0>,
        ch1: Peri<'static, peripherals::PPI_CH1>,
        ch2: Peri<'static, peripherals::PPI_CH2>,
        ch3: Peri<'static, peripherals::PPI_CH3>,
    ) -> Self {
        Self {
            _ch0: ch0,
            _ch1: ch1,
            _ch2: ch2,
            _ch3: ch3,
        }
    }
}

/// Priority of the EGU and TIMER interrupts.
///
/// Must stay below MPSL's high priority level (0) and must not preempt the
/// controller's low priority work for long.
pub const PREPARE_IRQ_PRIORITY: Priority = Priority::P2;

/// Backend initialization errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    AlreadyInitialized,
}

/// The nRF52840 platform for [`ConnEvtPrepare`]
pub struct NrfHardware {
    channels: ChannelPool,
    controller: SdcTrigger,
}

impl NrfHardware {
    pub const fn new() -> Self {
        Self {
            channels: ChannelPool::new(PREPARE_PPI_FIRST, PREPARE_PPI_COUNT),
            controller: SdcTrigger::new(),
        }
    }

    /// Routing channel pool, for diagnostics
    pub fn channels(&self) -> &ChannelPool {
        &self.channels
    }
}

impl Default for NrfHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelAllocator for NrfHardware {
    fn alloc_channel(&self) -> Result<RoutingChannel, ChannelError> {
        self.channels.alloc_channel()
    }

    fn free_channel(&self, channel: RoutingChannel) -> Result<(), ChannelError> {
        self.channels.free_channel(channel)
    }
}

impl EventInterrupts for NrfHardware {
    fn enable_event_irq(&self, event_channel: u8) {
        egu::enable(event_channel);
    }

    fn disable_event_irq(&self, event_channel: u8) {
        egu::disable(event_channel);
    }

    fn event_task_address(&self, event_channel: u8) -> u32 {
        egu::task_address(event_channel)
    }
}

impl DelayTimers for NrfHardware {
    fn start_delay(&self, slot: u8, delay_us: u32) {
        timer::start(slot, delay_us);
    }

    fn stop_delay(&self, slot: u8) {
        timer::stop(slot);
    }
}

impl TriggerController for NrfHardware {
    fn next_conn_event_counter(&self, conn_handle: u16) -> Result<u16, TriggerError> {
        self.controller.next_conn_event_counter(conn_handle)
    }

    fn set_conn_event_trigger(&self, trigger: &ConnEventTrigger) -> Result<(), TriggerError> {
        self.controller.set_conn_event_trigger(trigger)
    }
}

/// The process-wide prepare engine, one slot per connection index
pub static PREPARE: ConnEvtPrepare<NrfHardware, MAX_CONNECTIONS> = ConnEvtPrepare::new(NrfHardware::new());

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// One-time bring-up: claims EGU3, TIMER2 and the routing PPI channels,
/// configures the peripherals, enables their interrupts and attaches the
/// running controller.
///
/// Call after the SoftDevice Controller has been built.
pub fn init(
    _egu: Peri<'static, peripherals::EGU3>,
    _timer: Peri<'static, peripherals::TIMER2>,
    _routing: RoutingPpi,
    _irqs: impl Binding<EGU3_SWI3, EguInterruptHandler> + Binding<TIMER2, TimerInterruptHandler>,
    _sdc: &SoftdeviceController<'_>,
) -> Result<(), InitError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        warn!("PREPARE: Already initialized");
        return Err(InitError::AlreadyInitialized);
    }

    connection::init();
    egu::configure();
    timer::configure();
    PREPARE.hardware().controller.attach();

    info!(
        "PREPARE: Ready ({} slots, PPI channels {}..{})",
        MAX_CONNECTIONS,
        PREPARE_PPI_FIRST,
        PREPARE_PPI_FIRST + PREPARE_PPI_COUNT
    );

    Ok(())
}

/// Register `callback` to run `lead_time_us` before every connection event of
/// the connection with HCI handle `conn_handle`.
///
/// The callback runs in TIMER2 interrupt context.
pub fn register_prepare_callback(
    conn_handle: u16,
    callback: PrepareCallback,
    user_data: UserData,
    lead_time_us: u32,
) -> Result<ConnRef, PrepareError> {
    let conn = connection::with_connection_manager(|mgr| mgr.conn_ref(conn_handle))
        .ok_or(PrepareError::ConnectionInfoUnavailable)?;

    PREPARE.set(&GlobalConnections, conn, callback, user_data, lead_time_us)?;

    Ok(conn)
}

/// Feed a connection lifecycle event from the HCI event stream.
///
/// Keeps the connection registry current and tears down or refreshes
/// prepare registrations as links go away or change parameters.
pub fn connection_event(event: &ConnectionEvent) -> Result<ConnRef, ConnectionError> {
    let listeners: [&dyn ConnectionCallbacks; 1] = [&PREPARE];
    connection::with_connection_manager(|mgr| events::dispatch(mgr, &listeners, event))
}
