//! Common test utilities for host-side engine tests
//!
//! - `MockHardware`: a recording platform implementing every hardware seam
//! - `Link`: a connection registry wired to an engine through `dispatch`
//! - a callback that records every prepare notification per test thread

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::vec::Vec;

use nrf_conn_evt_prepare::ble::connection::{
    ConnRef, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionParams, Role, CONN_INTERVAL_UNIT_US,
    MAX_CONNECTIONS,
};
use nrf_conn_evt_prepare::ble::events::{dispatch, ConnectionCallbacks};
use nrf_conn_evt_prepare::ble::prepare::{ConnEvtPrepare, UserData};
use nrf_conn_evt_prepare::ble::trigger::{ConnEventTrigger, TriggerController, TriggerError};
use nrf_conn_evt_prepare::core::channels::{ChannelAllocator, ChannelError, ChannelPool, RoutingChannel};
use nrf_conn_evt_prepare::core::hal::{DelayTimers, EventInterrupts};

/// Base address of the fake software-event peripheral
pub const EVENT_TASK_BASE: u32 = 0x4001_4000;

/// Routing channels handed out by the mock, deliberately offset from 0
pub const FIRST_ROUTING_CHANNEL: u8 = 8;

/// Next connection event counter reported by the mock controller
pub const START_EVENT_COUNTER: u16 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    Start { slot: u8, delay_us: u32 },
    Stop { slot: u8 },
}

/// Recording hardware platform
pub struct MockHardware {
    pool: ChannelPool,
    irq_enabled: RefCell<[bool; MAX_CONNECTIONS]>,
    armed: RefCell<[Option<u32>; MAX_CONNECTIONS]>,
    timer_ops: RefCell<Vec<TimerOp>>,
    triggers: RefCell<Vec<ConnEventTrigger>>,
    counter_status: Cell<Option<u8>>,
    trigger_status: Cell<Option<u8>>,
}

impl MockHardware {
    pub fn new(pool_size: u8) -> Self {
        Self {
            pool: ChannelPool::new(FIRST_ROUTING_CHANNEL, pool_size),
            irq_enabled: RefCell::new([false; MAX_CONNECTIONS]),
            armed: RefCell::new([None; MAX_CONNECTIONS]),
            timer_ops: RefCell::new(Vec::new()),
            triggers: RefCell::new(Vec::new()),
            counter_status: Cell::new(None),
            trigger_status: Cell::new(None),
        }
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Make the next-event-counter command fail with `status`
    pub fn fail_counter_with(&self, status: Option<u8>) {
        self.counter_status.set(status);
    }

    /// Make the set-trigger command fail with `status`
    pub fn fail_trigger_with(&self, status: Option<u8>) {
        self.trigger_status.set(status);
    }

    pub fn irq_enabled(&self, event_channel: u8) -> bool {
        self.irq_enabled.borrow()[event_channel as usize]
    }

    /// Delay of the running timer for `slot`, if any
    pub fn armed_delay(&self, slot: u8) -> Option<u32> {
        self.armed.borrow()[slot as usize]
    }

    /// Let the running timer for `slot` expire; returns its delay
    pub fn expire(&self, slot: u8) -> Option<u32> {
        self.armed.borrow_mut()[slot as usize].take()
    }

    pub fn timer_ops(&self) -> Vec<TimerOp> {
        self.timer_ops.borrow().clone()
    }

    pub fn clear_timer_ops(&self) {
        self.timer_ops.borrow_mut().clear();
    }

    pub fn triggers(&self) -> Vec<ConnEventTrigger> {
        self.triggers.borrow().clone()
    }
}

impl ChannelAllocator for MockHardware {
    fn alloc_channel(&self) -> Result<RoutingChannel, ChannelError> {
        self.pool.alloc_channel()
    }

    fn free_channel(&self, channel: RoutingChannel) -> Result<(), ChannelError> {
        self.pool.free_channel(channel)
    }
}

impl EventInterrupts for MockHardware {
    fn enable_event_irq(&self, event_channel: u8) {
        self.irq_enabled.borrow_mut()[event_channel as usize] = true;
    }

    fn disable_event_irq(&self, event_channel: u8) {
        self.irq_enabled.borrow_mut()[event_channel as usize] = false;
    }

    fn event_task_address(&self, event_channel: u8) -> u32 {
        EVENT_TASK_BASE + 4 * event_channel as u32
    }
}

impl DelayTimers for MockHardware {
    fn start_delay(&self, slot: u8, delay_us: u32) {
        self.armed.borrow_mut()[slot as usize] = Some(delay_us);
        self.timer_ops.borrow_mut().push(TimerOp::Start { slot, delay_us });
    }

    fn stop_delay(&self, slot: u8) {
        self.armed.borrow_mut()[slot as usize] = None;
        self.timer_ops.borrow_mut().push(TimerOp::Stop { slot });
    }
}

impl TriggerController for MockHardware {
    fn next_conn_event_counter(&self, _conn_handle: u16) -> Result<u16, TriggerError> {
        match self.counter_status.get() {
            Some(status) => Err(TriggerError::Hci(status)),
            None => Ok(START_EVENT_COUNTER),
        }
    }

    fn set_conn_event_trigger(&self, trigger: &ConnEventTrigger) -> Result<(), TriggerError> {
        if let Some(status) = self.trigger_status.get() {
            return Err(TriggerError::Hci(status));
        }
        self.triggers.borrow_mut().push(*trigger);
        Ok(())
    }
}

pub type Engine = ConnEvtPrepare<MockHardware, MAX_CONNECTIONS>;

pub fn engine(pool_size: u8) -> Engine {
    ConnEvtPrepare::new(MockHardware::new(pool_size))
}

/// Connection parameters for an interval given in microseconds
pub fn params_us(interval_us: u32) -> ConnectionParams {
    ConnectionParams::new((interval_us / CONN_INTERVAL_UNIT_US) as u16, 0, 400)
}

/// Connection registry feeding lifecycle events to an engine, the way the
/// firmware's HCI event task does
pub struct Link<'a> {
    pub manager: ConnectionManager,
    engine: &'a Engine,
}

impl<'a> Link<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self {
            manager: ConnectionManager::new(),
            engine,
        }
    }

    fn apply(&mut self, event: ConnectionEvent) -> Result<ConnRef, ConnectionError> {
        let listeners: [&dyn ConnectionCallbacks; 1] = [self.engine];
        dispatch(&mut self.manager, &listeners, &event)
    }

    pub fn connect(&mut self, handle: u16, interval_us: u32) -> ConnRef {
        self.apply(ConnectionEvent::Connected {
            handle,
            role: Role::Peripheral,
            params: params_us(interval_us),
        })
        .unwrap()
    }

    pub fn update(&mut self, handle: u16, interval_us: u32) -> Result<ConnRef, ConnectionError> {
        self.apply(ConnectionEvent::ParamsUpdated {
            handle,
            params: params_us(interval_us),
        })
    }

    pub fn disconnect(&mut self, handle: u16) -> Result<ConnRef, ConnectionError> {
        self.apply(ConnectionEvent::Disconnected { handle, reason: 0x13 })
    }
}

/// Simulate one connection event: hardware fire, then timer expiry.
/// Returns the delay the timer was armed with, if it was armed at all.
pub fn run_connection_event(engine: &Engine, slot: u8) -> Option<u32> {
    engine.on_event_fired(slot);
    let delay = engine.hardware().expire(slot)?;
    engine.on_timer_expired(slot);
    Some(delay)
}

thread_local! {
    static NOTIFICATIONS: RefCell<Vec<(ConnRef, UserData)>> = const { RefCell::new(Vec::new()) };
}

/// Prepare callback recording into a per-thread log
pub fn record_prepare(conn: ConnRef, user_data: UserData) {
    NOTIFICATIONS.with(|n| n.borrow_mut().push((conn, user_data)));
}

/// Take every notification recorded on this thread so far
pub fn take_notifications() -> Vec<(ConnRef, UserData)> {
    NOTIFICATIONS.with(|n| core::mem::take(&mut *n.borrow_mut()))
}
