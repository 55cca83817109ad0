//! Connection Event Trigger Installation
//!
//! Arms the radio controller to pulse a routing channel on every connection
//! event of a link, starting a few events in the future. The pulse lands on a
//! software-event task, which is what eventually raises the prepare
//! interrupt.

use crate::ble::connection::ConnRef;
use crate::core::channels::RoutingChannel;

/// Connection events between "now" and the first trigger.
///
/// Arming "every event from N events ahead" instead of "the next event" keeps
/// the command's own completion from racing the next event boundary.
pub const TRIGGER_LEAD_IN_EVENTS: u16 = 10;

/// Fire on every connection event
pub const TRIGGER_PERIOD_EVENTS: u16 = 1;

/// Trigger role selector for connection events (vs. scanner/advertiser)
pub const TRIGGER_ROLE_CONN: u8 = 0;

/// Description of an armed connection event trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnEventTrigger {
    pub conn_handle: u16,
    pub role: u8,
    pub channel: RoutingChannel,
    pub period_in_events: u16,
    pub start_event_counter: u16,
    /// Address of the task the routing channel triggers
    pub task_endpoint: u32,
}

/// Trigger installation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TriggerError {
    /// The controller rejected a command with this HCI status
    Hci(u8),
    /// No controller has been attached yet
    ControllerUnavailable,
}

/// Vendor-specific controller commands needed to arm a trigger
pub trait TriggerController {
    /// Counter value of the next connection event on `conn_handle`
    fn next_conn_event_counter(&self, conn_handle: u16) -> Result<u16, TriggerError>;

    /// Arm a periodic connection event trigger
    fn set_conn_event_trigger(&self, trigger: &ConnEventTrigger) -> Result<(), TriggerError>;
}

/// Arm `channel` to fire `task_endpoint` on every event of `conn`.
///
/// Blocks for the controller command round-trips; call it outside any
/// critical section.
pub fn install<C>(
    controller: &C,
    conn: ConnRef,
    channel: RoutingChannel,
    task_endpoint: u32,
) -> Result<ConnEventTrigger, TriggerError>
where
    C: TriggerController + ?Sized,
{
    let next = controller.next_conn_event_counter(conn.handle()).map_err(|e| {
        error!(
            "TRIGGER: Failed obtaining next conn event count for {} ({:?})",
            conn.handle(),
            e
        );
        e
    })?;

    let trigger = ConnEventTrigger {
        conn_handle: conn.handle(),
        role: TRIGGER_ROLE_CONN,
        channel,
        period_in_events: TRIGGER_PERIOD_EVENTS,
        // Event counters are 16 bit and wrap
        start_event_counter: next.wrapping_add(TRIGGER_LEAD_IN_EVENTS),
        task_endpoint,
    };

    controller.set_conn_event_trigger(&trigger).map_err(|e| {
        error!("TRIGGER: Failed arming trigger for {} ({:?})", conn.handle(), e);
        e
    })?;

    debug!(
        "TRIGGER: Armed conn {} on channel {} from event {}",
        trigger.conn_handle,
        channel.number(),
        trigger.start_event_counter
    );

    Ok(trigger)
}
