//! Connection Event Prepare Callbacks
//!
//! Notifies the application a fixed lead time before each connection event
//! of a link, so data can be sampled right before it goes on air.
//!
//! Trigger chain per connection event:
//!
//! 1. the radio controller pulses the slot's routing channel,
//! 2. the routing channel fires the slot's software-event task,
//! 3. the software-event interrupt ([`ConnEvtPrepare::on_event_fired`]) arms
//!    a one-shot timer for `interval - lead_time`,
//! 4. timer expiry ([`ConnEvtPrepare::on_timer_expired`]) invokes the
//!    registered callback.
//!
//! The event fires as the *current* connection event starts, so waiting one
//! interval minus the lead time lands just ahead of the *next* one.
//!
//! # Slot fields and their writers
//!
//! | field            | written by                                   |
//! |------------------|----------------------------------------------|
//! | `callback`       | registration (set), disconnect (clear)       |
//! | `conn`, `user_data`, `lead_time_us`, `channel` | registration    |
//! | `conn_interval_us` | registration, parameter update             |
//!
//! Interrupt and timer paths only read. Every access goes through a short
//! critical section, and both read paths bail out on a cleared callback, so
//! a disconnect racing an in-flight interrupt costs at most one missed
//! notification.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::ble::connection::{ConnRef, ConnectionInfoSource, ConnectionParams};
use crate::ble::events::ConnectionCallbacks;
use crate::ble::trigger::{self, TriggerController, TriggerError};
use crate::core::channels::{ChannelAllocator, ChannelError, RoutingChannel};
use crate::core::hal::{DelayTimers, EventInterrupts};

/// Prepare callback.
///
/// Runs in timer-expiry context, not on an application task. Anything that
/// needs the BLE host must be handed off to a task first.
pub type PrepareCallback = fn(conn: ConnRef, user_data: UserData);

/// Opaque value handed back to the callback unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(*mut ());

// The engine never dereferences the pointer; it is only carried to the
// callback that supplied it.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    pub const NONE: Self = Self(core::ptr::null_mut());

    pub const fn new(ptr: *mut ()) -> Self {
        Self(ptr)
    }

    /// Carry a reference to static data
    pub fn from_static<T: Sync>(data: &'static T) -> Self {
        Self(data as *const T as *mut ())
    }

    pub const fn as_ptr(self) -> *mut () {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for UserData {
    fn default() -> Self {
        Self::NONE
    }
}

/// Registration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PrepareError {
    /// The connection already has a prepare callback
    AlreadyRegistered,
    /// No routing channel is free
    ResourceExhausted,
    /// The connection's interval could not be read
    ConnectionInfoUnavailable,
    /// Lead time is not below the current connection interval
    InvalidLeadTime,
    /// The controller refused to arm the trigger
    Trigger(TriggerError),
}

impl From<ChannelError> for PrepareError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Exhausted => PrepareError::ResourceExhausted,
            // Allocation never reports this
            ChannelError::NotAllocated => PrepareError::ResourceExhausted,
        }
    }
}

impl From<TriggerError> for PrepareError {
    fn from(err: TriggerError) -> Self {
        PrepareError::Trigger(err)
    }
}

/// Everything the engine needs from the platform
pub trait PrepareHardware: ChannelAllocator + EventInterrupts + DelayTimers + TriggerController {}

impl<T> PrepareHardware for T where T: ChannelAllocator + EventInterrupts + DelayTimers + TriggerController {}

#[derive(Clone, Copy)]
struct Slot {
    /// `None` marks the slot inactive
    callback: Option<PrepareCallback>,
    conn: ConnRef,
    user_data: UserData,
    lead_time_us: u32,
    conn_interval_us: u32,
    channel: RoutingChannel,
}

impl Slot {
    const EMPTY: Self = Self {
        callback: None,
        conn: ConnRef::new(0, 0),
        user_data: UserData::NONE,
        lead_time_us: 0,
        conn_interval_us: 0,
        channel: RoutingChannel::new(0),
    };

    fn is_active(&self) -> bool {
        self.callback.is_some()
    }
}

/// Per-connection prepare notification engine.
///
/// `N` is the number of connection slots; slot `i` belongs to connection
/// index `i` and owns software-event channel `i` and delay timer `i`.
pub struct ConnEvtPrepare<H: PrepareHardware, const N: usize> {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[Slot; N]>>,
    hw: H,
}

impl<H: PrepareHardware, const N: usize> ConnEvtPrepare<H, N> {
    pub const fn new(hw: H) -> Self {
        Self {
            slots: Mutex::new(RefCell::new([Slot::EMPTY; N])),
            hw,
        }
    }

    /// Platform backing this engine
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Register `callback` to run `lead_time_us` before every connection
    /// event of `conn`.
    ///
    /// Either everything is set up or nothing is: on failure no channel stays
    /// reserved and the slot remains inactive.
    pub fn set<S>(
        &self,
        info: &S,
        conn: ConnRef,
        callback: PrepareCallback,
        user_data: UserData,
        lead_time_us: u32,
    ) -> Result<(), PrepareError>
    where
        S: ConnectionInfoSource + ?Sized,
    {
        let index = self.slot_index(conn).ok_or(PrepareError::ConnectionInfoUnavailable)?;

        if self.with_slot(index, |slot| slot.is_active()) {
            return Err(PrepareError::AlreadyRegistered);
        }

        let conn_interval_us = info
            .conn_interval_us(conn)
            .ok_or(PrepareError::ConnectionInfoUnavailable)?;

        if lead_time_us >= conn_interval_us {
            warn!(
                "PREPARE: Lead time {} us does not fit interval {} us",
                lead_time_us, conn_interval_us
            );
            return Err(PrepareError::InvalidLeadTime);
        }

        let channel = self.hw.alloc_channel().map_err(|e| {
            warn!("PREPARE: No routing channel for conn {}", conn.handle());
            PrepareError::from(e)
        })?;

        let event_channel = index as u8;

        let claimed = self.with_slot_mut(index, |slot| {
            if slot.is_active() {
                return false;
            }
            *slot = Slot {
                callback: Some(callback),
                conn,
                user_data,
                lead_time_us,
                conn_interval_us,
                channel,
            };
            true
        });

        if !claimed {
            // Lost a race against another registration for this connection
            let freed = self.hw.free_channel(channel);
            debug_assert!(freed.is_ok());
            return Err(PrepareError::AlreadyRegistered);
        }

        // Timer stays idle until the first hardware fire
        self.hw.stop_delay(event_channel);
        self.hw.enable_event_irq(event_channel);

        let task_endpoint = self.hw.event_task_address(event_channel);
        if let Err(e) = trigger::install(&self.hw, conn, channel, task_endpoint) {
            self.rollback(index);
            return Err(e.into());
        }

        info!(
            "PREPARE: Conn {} notified {} us ahead (interval {} us, channel {})",
            conn.handle(),
            lead_time_us,
            conn_interval_us,
            channel.number()
        );

        Ok(())
    }

    /// Software-event interrupt for `event_channel`.
    ///
    /// Interrupt context: constant time, no allocation, no callbacks.
    pub fn on_event_fired(&self, event_channel: u8) {
        let index = event_channel as usize;
        assert!(index < N, "event channel {} out of range", event_channel);

        let Some((interval_us, lead_us)) = self.with_slot(index, |slot| {
            slot.is_active()
                .then_some((slot.conn_interval_us, slot.lead_time_us))
        }) else {
            return;
        };

        // A lead time at or past the interval would wrap the delay
        assert!(
            interval_us > lead_us,
            "conn interval {} us not above lead time {} us",
            interval_us,
            lead_us
        );

        let delay_us = interval_us - lead_us;
        self.hw.start_delay(event_channel, delay_us);

        trace!("PREPARE: Slot {} timer armed for {} us", event_channel, delay_us);
    }

    /// Delay timer expiry for `slot`: hand the notification to the
    /// application.
    ///
    /// Interrupt context. The callback runs outside the slot lock.
    pub fn on_timer_expired(&self, slot: u8) {
        let index = slot as usize;
        assert!(index < N, "delay timer {} out of range", slot);

        let target = self.with_slot(index, |slot| {
            slot.callback.map(|callback| (callback, slot.conn, slot.user_data))
        });

        if let Some((callback, conn, user_data)) = target {
            callback(conn, user_data);
        }
    }

    /// Refresh the cached interval after a parameter update.
    /// No effect on connections without a registration.
    pub fn on_params_updated(&self, conn: ConnRef, conn_interval_us: u32) {
        let Some(index) = self.slot_index(conn) else {
            return;
        };

        let updated = self.with_slot_mut(index, |slot| {
            if slot.is_active() && slot.conn == conn {
                slot.conn_interval_us = conn_interval_us;
                true
            } else {
                false
            }
        });

        if updated {
            debug!(
                "PREPARE: Conn {} interval now {} us",
                conn.handle(),
                conn_interval_us
            );
        }
    }

    /// Tear down the registration of a disconnected connection.
    /// Safe to call for connections that never registered, and to repeat.
    pub fn on_disconnected(&self, conn: ConnRef, reason: u8) {
        let Some(index) = self.slot_index(conn) else {
            return;
        };

        // Deactivate first so in-flight interrupt/timer paths bail out
        let released = self.with_slot_mut(index, |slot| {
            if slot.is_active() && slot.conn == conn {
                slot.callback = None;
                Some(slot.channel)
            } else {
                None
            }
        });

        let Some(channel) = released else {
            return;
        };

        let event_channel = index as u8;
        self.hw.disable_event_irq(event_channel);
        self.hw.stop_delay(event_channel);

        let freed = self.hw.free_channel(channel);
        assert!(freed.is_ok(), "routing channel {} was not allocated", channel.number());

        debug!(
            "PREPARE: Conn {} torn down (reason {}), channel {} released",
            conn.handle(),
            reason,
            channel.number()
        );
    }

    /// Whether `conn` has an active registration
    pub fn is_active(&self, conn: ConnRef) -> bool {
        self.active_slot(conn, |_| ()).is_some()
    }

    /// Cached connection interval of an active registration
    pub fn conn_interval_us(&self, conn: ConnRef) -> Option<u32> {
        self.active_slot(conn, |slot| slot.conn_interval_us)
    }

    /// Requested lead time of an active registration
    pub fn lead_time_us(&self, conn: ConnRef) -> Option<u32> {
        self.active_slot(conn, |slot| slot.lead_time_us)
    }

    /// Routing channel owned by an active registration
    pub fn routing_channel(&self, conn: ConnRef) -> Option<RoutingChannel> {
        self.active_slot(conn, |slot| slot.channel)
    }

    /// Number of active registrations
    pub fn active_count(&self) -> usize {
        self.slots
            .lock(|slots| slots.borrow().iter().filter(|s| s.is_active()).count())
    }

    fn rollback(&self, index: usize) {
        let channel = self.with_slot_mut(index, |slot| {
            slot.callback = None;
            slot.channel
        });

        let event_channel = index as u8;
        self.hw.disable_event_irq(event_channel);
        self.hw.stop_delay(event_channel);

        let freed = self.hw.free_channel(channel);
        assert!(freed.is_ok(), "routing channel {} was not allocated", channel.number());

        warn!("PREPARE: Registration on slot {} rolled back", index);
    }

    fn slot_index(&self, conn: ConnRef) -> Option<usize> {
        let index = conn.index() as usize;
        (index < N).then_some(index)
    }

    fn active_slot<R>(&self, conn: ConnRef, f: impl FnOnce(&Slot) -> R) -> Option<R> {
        let index = self.slot_index(conn)?;
        self.with_slot(index, |slot| {
            (slot.is_active() && slot.conn == conn).then(|| f(slot))
        })
    }

    fn with_slot<R>(&self, index: usize, f: impl FnOnce(&Slot) -> R) -> R {
        self.slots.lock(|slots| f(&slots.borrow()[index]))
    }

    fn with_slot_mut<R>(&self, index: usize, f: impl FnOnce(&mut Slot) -> R) -> R {
        self.slots.lock(|slots| f(&mut slots.borrow_mut()[index]))
    }
}

impl<H: PrepareHardware, const N: usize> ConnectionCallbacks for ConnEvtPrepare<H, N> {
    fn disconnected(&self, conn: ConnRef, reason: u8) {
        self.on_disconnected(conn, reason);
    }

    fn params_updated(&self, conn: ConnRef, params: &ConnectionParams) {
        self.on_params_updated(conn, params.interval_us());
    }
}
