//! Software-event channels on EGU3
//!
//! Trigger `n` belongs to connection slot `n`. The radio controller fires
//! the trigger task through a routing channel; the resulting interrupt arms
//! that slot's delay timer.

use embassy_nrf::interrupt::typelevel::{self, Interrupt as _};
use embassy_nrf::pac;

use super::PREPARE;
use crate::ble::connection::MAX_CONNECTIONS;

/// Triggers available on one EGU instance
pub const EGU_TRIGGER_COUNT: usize = 16;

const _: () = ::core::assert!(MAX_CONNECTIONS <= EGU_TRIGGER_COUNT);

pub(crate) type EguInterrupt = typelevel::EGU3_SWI3;

fn regs() -> pac::egu::Egu {
    pac::EGU3
}

pub(crate) fn configure() {
    let r = regs();
    r.intenclr().write(|w| w.0 = u32::MAX);
    for n in 0..MAX_CONNECTIONS {
        r.events_triggered(n).write_value(0);
    }

    EguInterrupt::unpend();
    EguInterrupt::set_priority(super::PREPARE_IRQ_PRIORITY);
    unsafe { EguInterrupt::enable() };
}

pub(crate) fn enable(event_channel: u8) {
    let n = event_channel as usize;
    regs().events_triggered(n).write_value(0);
    regs().intenset().write(|w| w.set_triggered(n, true));
}

pub(crate) fn disable(event_channel: u8) {
    regs().intenclr().write(|w| w.set_triggered(event_channel as usize, true));
}

pub(crate) fn task_address(event_channel: u8) -> u32 {
    regs().tasks_trigger(event_channel as usize).as_ptr() as u32
}

/// EGU3 interrupt handler, bind it with `bind_interrupts!`
pub struct InterruptHandler {
    _private: (),
}

impl typelevel::Handler<EguInterrupt> for InterruptHandler {
    unsafe fn on_interrupt() {
        let r = regs();
        for n in 0..MAX_CONNECTIONS {
            if r.events_triggered(n).read() == 0 {
                continue;
            }
            r.events_triggered(n).write_value(0);
            PREPARE.on_event_fired(n as u8);
        }
    }
}
