//! Hardware seams used by the prepare engine
//!
//! The engine never touches registers. Each platform supplies these pieces
//! (the nRF backend in `crate::nrf`, a recording mock in the tests).

/// Per-channel interrupt control for the software-event peripheral (EGU).
///
/// Channel `n` is the event sub-channel owned by connection slot `n`.
pub trait EventInterrupts {
    fn enable_event_irq(&self, event_channel: u8);
    fn disable_event_irq(&self, event_channel: u8);

    /// Address of the task that fires `event_channel`, as handed to the
    /// radio controller for hardware routing.
    fn event_task_address(&self, event_channel: u8) -> u32;
}

/// One-shot microsecond timers, one per connection slot.
///
/// `start_delay` on a running timer restarts it. Both calls must be
/// non-blocking; `start_delay` is called from interrupt context.
pub trait DelayTimers {
    fn start_delay(&self, slot: u8, delay_us: u32);
    fn stop_delay(&self, slot: u8);
}
