//! One-shot delay timers on TIMER2
//!
//! The timer free-runs at 1 MHz in 32-bit mode. Each connection slot owns
//! one compare channel; a delay is armed by capturing "now", programming
//! `now + delay` and enabling that compare interrupt. The interrupt is
//! disabled again on expiry, which makes it one-shot.

use embassy_nrf::interrupt::typelevel::{self, Interrupt as _};
use embassy_nrf::pac;
use embassy_nrf::pac::timer::vals;

use super::PREPARE;
use crate::ble::connection::MAX_CONNECTIONS;

/// Compare channels on TIMER0..TIMER2
pub const TIMER_CC_COUNT: usize = 4;

/// 16 MHz / 2^4
const PRESCALER_1MHZ: u8 = 4;

/// A compare value this close to "now" could be passed before it is written
const MIN_DELAY_US: u32 = 2;

const _: () = ::core::assert!(MAX_CONNECTIONS <= TIMER_CC_COUNT);

pub(crate) type TimerInterrupt = typelevel::TIMER2;

fn regs() -> pac::timer::Timer {
    pac::TIMER2
}

pub(crate) fn configure() {
    let r = regs();
    r.tasks_stop().write_value(1);
    r.intenclr().write(|w| w.0 = u32::MAX);
    r.shorts().write(|w| w.0 = 0);
    r.mode().write(|w| w.set_mode(vals::Mode::TIMER));
    r.bitmode().write(|w| w.set_bitmode(vals::Bitmode::_32BIT));
    r.prescaler().write(|w| w.set_prescaler(PRESCALER_1MHZ));
    for n in 0..MAX_CONNECTIONS {
        r.events_compare(n).write_value(0);
    }
    r.tasks_clear().write_value(1);
    r.tasks_start().write_value(1);

    TimerInterrupt::unpend();
    TimerInterrupt::set_priority(super::PREPARE_IRQ_PRIORITY);
    unsafe { TimerInterrupt::enable() };
}

pub(crate) fn start(slot: u8, delay_us: u32) {
    let r = regs();
    let n = slot as usize;

    r.intenclr().write(|w| w.set_compare(n, true));
    r.tasks_capture(n).write_value(1);
    let now = r.cc(n).read();
    r.cc(n).write_value(now.wrapping_add(delay_us.max(MIN_DELAY_US)));
    r.events_compare(n).write_value(0);
    r.intenset().write(|w| w.set_compare(n, true));
}

pub(crate) fn stop(slot: u8) {
    let r = regs();
    let n = slot as usize;

    r.intenclr().write(|w| w.set_compare(n, true));
    r.events_compare(n).write_value(0);
}

/// TIMER2 interrupt handler, bind it with `bind_interrupts!`
pub struct InterruptHandler {
    _private: (),
}

impl typelevel::Handler<TimerInterrupt> for InterruptHandler {
    unsafe fn on_interrupt() {
        let r = regs();
        let armed = r.intenset().read();
        for n in 0..MAX_CONNECTIONS {
            if !armed.compare(n) || r.events_compare(n).read() == 0 {
                continue;
            }
            stop(n as u8);
            PREPARE.on_timer_expired(n as u8);
        }
    }
}
