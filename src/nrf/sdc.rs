//! Connection event trigger commands on the SoftDevice Controller

use core::sync::atomic::{AtomicBool, Ordering};

use nrf_sdc::raw;

use crate::ble::trigger::{ConnEventTrigger, TriggerController, TriggerError};

/// Issues the vendor-specific trigger commands once a controller is running
pub struct SdcTrigger {
    ready: AtomicBool,
}

impl SdcTrigger {
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    /// Called once the controller has been built and enabled
    pub(crate) fn attach(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn ensure_ready(&self) -> Result<(), TriggerError> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TriggerError::ControllerUnavailable)
        }
    }
}

impl Default for SdcTrigger {
    fn default() -> Self {
        Self::new()
    }
}

fn check(status: u8) -> Result<(), TriggerError> {
    bt_hci::param::Status::from(status).to_result().map_err(|e| {
        warn!("TRIGGER: Controller returned {:?}", e);
        TriggerError::Hci(status)
    })
}

impl TriggerController for SdcTrigger {
    fn next_conn_event_counter(&self, conn_handle: u16) -> Result<u16, TriggerError> {
        self.ensure_ready()?;

        let params = raw::sdc_hci_cmd_vs_get_next_conn_event_counter_t { conn_handle };
        let mut ret: raw::sdc_hci_cmd_vs_get_next_conn_event_counter_return_t = unsafe { core::mem::zeroed() };
        check(unsafe { raw::sdc_hci_cmd_vs_get_next_conn_event_counter(&params, &mut ret) })?;

        Ok(ret.next_conn_event_counter)
    }

    fn set_conn_event_trigger(&self, trigger: &ConnEventTrigger) -> Result<(), TriggerError> {
        self.ensure_ready()?;

        let params = raw::sdc_hci_cmd_vs_set_conn_event_trigger_t {
            conn_handle: trigger.conn_handle,
            role: trigger.role,
            ppi_ch_id: trigger.channel.number(),
            period_in_events: trigger.period_in_events,
            conn_evt_counter_start: trigger.start_event_counter,
            task_endpoint: trigger.task_endpoint,
        };
        check(unsafe { raw::sdc_hci_cmd_vs_set_conn_event_trigger(&params) })
    }
}
