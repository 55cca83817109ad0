#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use bt_hci::cmd::controller_baseband::{Reset, SetEventMask};
use bt_hci::cmd::le::{LeSetAdvData, LeSetAdvEnable, LeSetAdvParams, LeSetEventMask, LeSetRandomAddr};
use bt_hci::cmd::SyncCmd;
use bt_hci::controller::Controller;
use bt_hci::event::le::{LeConnectionComplete, LeConnectionUpdateComplete, LeEventKind, LeEventPacket};
use bt_hci::event::{DisconnectionComplete, EventKind, EventPacket};
use bt_hci::param::{
    AddrKind, AdvChannelMap, AdvFilterPolicy, AdvKind, BdAddr, Duration as HciDuration, EventMask, LeEventMask,
    Role as HciRole,
};
use bt_hci::{ControllerToHostPacket, FromHciBytes};
use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_nrf::mode::Async;
use embassy_nrf::{bind_interrupts, config::Config, interrupt, pac, peripherals, rng};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Instant;
use nrf_conn_evt_prepare::ble::connection::{connection_event_receiver, ConnRef, ConnectionEvent, ConnectionParams, Role};
use nrf_conn_evt_prepare::nrf;
use nrf_conn_evt_prepare::UserData;
use nrf_sdc::{self as sdc, mpsl};
use panic_probe as _;
use static_cell::StaticCell;

type Sdc = sdc::SoftdeviceController<'static>;

/// Memory for one peripheral link with 251 byte buffers
const SDC_MEMORY_SIZE: usize = 4720;

const L2CAP_MTU: u16 = 251;
const L2CAP_TXQ: u8 = 3;
const L2CAP_RXQ: u8 = 3;

/// How far ahead of each connection event the application wants to hear
const PREPARE_LEAD_TIME_US: u32 = 2_000;

const DEVICE_NAME: &[u8] = b"ConnEvtPrepare";

bind_interrupts!(struct Irqs {
    EGU0_SWI0 => mpsl::LowPrioInterruptHandler;
    CLOCK_POWER => mpsl::ClockInterruptHandler;
    RADIO => mpsl::HighPrioInterruptHandler;
    TIMER0 => mpsl::HighPrioInterruptHandler;
    RTC0 => mpsl::HighPrioInterruptHandler;
    RNG => rng::InterruptHandler<peripherals::RNG>;
    EGU3_SWI3 => nrf::EguInterruptHandler;
    TIMER2 => nrf::TimerInterruptHandler;
});

/// Prepare notifications delivered so far, handed to the callback as user data
static PREPARE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Hands prepare notifications from interrupt context to a task
static PREPARE_SIGNAL: Signal<CriticalSectionRawMutex, ConnRef> = Signal::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Starting connection event prepare demo");

    let mut nrf_config = Config::default();
    // Stay clear of the levels MPSL reserves for itself
    nrf_config.gpiote_interrupt_priority = interrupt::Priority::P2;
    nrf_config.time_interrupt_priority = interrupt::Priority::P2;
    let p = embassy_nrf::init(nrf_config);

    info!("MPSL initialization");
    let mpsl_p = mpsl::Peripherals::new(p.RTC0, p.TIMER0, p.TEMP, p.PPI_CH19, p.PPI_CH30, p.PPI_CH31);
    let lfclk_cfg = mpsl::raw::mpsl_clock_lfclk_cfg_t {
        source: mpsl::raw::MPSL_CLOCK_LF_SRC_RC as u8,
        rc_ctiv: mpsl::raw::MPSL_RECOMMENDED_RC_CTIV as u8,
        rc_temp_ctiv: mpsl::raw::MPSL_RECOMMENDED_RC_TEMP_CTIV as u8,
        accuracy_ppm: mpsl::raw::MPSL_DEFAULT_CLOCK_ACCURACY_PPM as u16,
        skip_wait_lfclk_started: mpsl::raw::MPSL_DEFAULT_SKIP_WAIT_LFCLK_STARTED != 0,
    };
    static MPSL: StaticCell<mpsl::MultiprotocolServiceLayer> = StaticCell::new();
    let mpsl = MPSL.init(unwrap!(mpsl::MultiprotocolServiceLayer::new(mpsl_p, Irqs, lfclk_cfg)));
    spawner.spawn(unwrap!(mpsl_task(mpsl)));

    info!("SDC initialization");
    let sdc_p = sdc::Peripherals::new(
        p.PPI_CH17, p.PPI_CH18, p.PPI_CH20, p.PPI_CH21, p.PPI_CH22, p.PPI_CH23, p.PPI_CH24, p.PPI_CH25, p.PPI_CH26,
        p.PPI_CH27, p.PPI_CH28, p.PPI_CH29,
    );
    static RNG: StaticCell<rng::Rng<'static, Async>> = StaticCell::new();
    let rng = RNG.init(rng::Rng::new(p.RNG, Irqs));
    static SDC_MEM: StaticCell<sdc::Mem<SDC_MEMORY_SIZE>> = StaticCell::new();
    let sdc_mem = SDC_MEM.init(sdc::Mem::new());

    let controller = unwrap!(unwrap!(sdc::Builder::new())
        .support_adv()
        .support_peripheral()
        .peripheral_count(1)
        .and_then(|b| b.buffer_cfg(L2CAP_MTU, L2CAP_MTU, L2CAP_TXQ, L2CAP_RXQ))
        .and_then(|b| b.build(sdc_p, rng, mpsl, sdc_mem)));
    static SDC: StaticCell<Sdc> = StaticCell::new();
    let sdc: &'static Sdc = SDC.init(controller);

    let routing = nrf::RoutingPpi::new(p.PPI_CH0, p.PPI_CH1, p.PPI_CH2, p.PPI_CH3);
    unwrap!(nrf::init(p.EGU3, p.TIMER2, routing, Irqs, sdc));

    unwrap!(setup_controller(sdc).await);

    spawner.spawn(unwrap!(hci_event_task(sdc)));
    spawner.spawn(unwrap!(prepare_log_task()));
    spawner.spawn(unwrap!(app_task(sdc)));

    info!("System initialized, advertising as {=[u8]:a}", DEVICE_NAME);
}

/// Reset the controller, unmask the events we decode and start advertising
async fn setup_controller(sdc: &'static Sdc) -> Result<(), bt_hci::cmd::Error<sdc::Error>> {
    Reset::new().exec(sdc).await?;

    SetEventMask::new(
        EventMask::new()
            .enable_disconnection_complete(true)
            .enable_le_meta(true),
    )
    .exec(sdc)
    .await?;
    LeSetEventMask::new(
        LeEventMask::new()
            .enable_le_conn_complete(true)
            .enable_le_conn_update_complete(true),
    )
    .exec(sdc)
    .await?;

    LeSetRandomAddr::new(BdAddr::new(static_random_address())).exec(sdc).await?;

    LeSetAdvParams::new(
        HciDuration::from_millis(100),
        HciDuration::from_millis(100),
        AdvKind::AdvInd,
        AddrKind::RANDOM,
        AddrKind::PUBLIC,
        BdAddr::new([0; 6]),
        AdvChannelMap::ALL,
        AdvFilterPolicy::default(),
    )
    .exec(sdc)
    .await?;

    let (len, data) = adv_data();
    LeSetAdvData::new(len, data).exec(sdc).await?;

    start_advertising(sdc).await
}

async fn start_advertising(sdc: &'static Sdc) -> Result<(), bt_hci::cmd::Error<sdc::Error>> {
    LeSetAdvEnable::new(true).exec(sdc).await
}

/// Flags plus complete local name
fn adv_data() -> (u8, [u8; 31]) {
    let mut data = [0u8; 31];
    data[..3].copy_from_slice(&[0x02, 0x01, 0x06]);
    data[3] = DEVICE_NAME.len() as u8 + 1;
    data[4] = 0x09;
    data[5..5 + DEVICE_NAME.len()].copy_from_slice(DEVICE_NAME);
    ((5 + DEVICE_NAME.len()) as u8, data)
}

/// Static random address burned into FICR
fn static_random_address() -> [u8; 6] {
    let lo = pac::FICR.deviceaddr(0).read().to_le_bytes();
    let hi = (pac::FICR.deviceaddr(1).read() as u16 | 0xC000).to_le_bytes();
    [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1]]
}

/// Decode the lifecycle events the prepare engine cares about
fn decode_event(event: &EventPacket<'_>) -> Option<ConnectionEvent> {
    match event.kind {
        EventKind::DisconnectionComplete => {
            let e = DisconnectionComplete::from_hci_bytes_complete(event.data).ok()?;
            e.status.to_result().ok()?;
            Some(ConnectionEvent::Disconnected {
                handle: e.handle.raw(),
                reason: e.reason.into_inner(),
            })
        }
        EventKind::Le => {
            let le = LeEventPacket::from_hci_bytes_complete(event.data).ok()?;
            match le.kind {
                LeEventKind::LeConnectionComplete => {
                    let e = LeConnectionComplete::from_hci_bytes_complete(le.data).ok()?;
                    e.status.to_result().ok()?;
                    let role = match e.role {
                        HciRole::Central => Role::Central,
                        _ => Role::Peripheral,
                    };
                    Some(ConnectionEvent::Connected {
                        handle: e.handle.raw(),
                        role,
                        params: ConnectionParams::new(
                            e.conn_interval.as_u16(),
                            e.peripheral_latency,
                            e.supervision_timeout.as_u16(),
                        ),
                    })
                }
                LeEventKind::LeConnectionUpdateComplete => {
                    let e = LeConnectionUpdateComplete::from_hci_bytes_complete(le.data).ok()?;
                    e.status.to_result().ok()?;
                    Some(ConnectionEvent::ParamsUpdated {
                        handle: e.handle.raw(),
                        params: ConnectionParams::new(
                            e.conn_interval.as_u16(),
                            e.peripheral_latency,
                            e.supervision_timeout.as_u16(),
                        ),
                    })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Runs in TIMER2 interrupt context: count and defer to a task
fn on_prepare(conn: ConnRef, user_data: UserData) {
    // SAFETY: registered with `UserData::from_static(&PREPARE_COUNT)`
    let count = unsafe { &*(user_data.as_ptr() as *const AtomicU32) };
    count.fetch_add(1, Ordering::Relaxed);
    PREPARE_SIGNAL.signal(conn);
}

#[embassy_executor::task]
async fn mpsl_task(mpsl: &'static mpsl::MultiprotocolServiceLayer<'static>) -> ! {
    mpsl.run().await
}

#[embassy_executor::task]
async fn hci_event_task(sdc: &'static Sdc) -> ! {
    let mut buf = [0u8; sdc::raw::HCI_MSG_BUFFER_MAX_SIZE as usize];
    loop {
        let packet = match sdc.read(&mut buf).await {
            Ok(packet) => packet,
            Err(e) => {
                error!("HCI: Read failed: {:?}", e);
                continue;
            }
        };

        let ControllerToHostPacket::Event(event) = packet else {
            continue;
        };

        if let Some(event) = decode_event(&event) {
            if let Err(e) = nrf::connection_event(&event) {
                warn!("HCI: Dropped {:?}: {:?}", event, e);
            }
        }
    }
}

#[embassy_executor::task]
async fn app_task(sdc: &'static Sdc) -> ! {
    let events = connection_event_receiver();
    loop {
        match events.receive().await {
            ConnectionEvent::Connected { handle, params, .. } => {
                info!("Connected {} (interval {} us)", handle, params.interval_us());
                match nrf::register_prepare_callback(
                    handle,
                    on_prepare,
                    UserData::from_static(&PREPARE_COUNT),
                    PREPARE_LEAD_TIME_US,
                ) {
                    Ok(conn) => info!("Prepare callback armed on slot {}", conn.index()),
                    Err(e) => warn!("Prepare callback not armed: {:?}", e),
                }
            }
            ConnectionEvent::ParamsUpdated { handle, params } => {
                info!("Connection {} interval now {} us", handle, params.interval_us());
            }
            ConnectionEvent::Disconnected { handle, reason } => {
                info!("Disconnected {} (reason {:#04x})", handle, reason);
                if let Err(e) = start_advertising(sdc).await {
                    error!("Advertising restart failed: {:?}", e);
                }
            }
        }
    }
}

#[embassy_executor::task]
async fn prepare_log_task() -> ! {
    let mut last: Option<Instant> = None;
    loop {
        let conn = PREPARE_SIGNAL.wait().await;
        let now = Instant::now();
        let since_last = last.map(|t| (now - t).as_micros()).unwrap_or(0);
        last = Some(now);

        info!(
            "Prepare #{} for conn {} ({} us since previous)",
            PREPARE_COUNT.load(Ordering::Relaxed),
            conn.handle(),
            since_last
        );
    }
}
