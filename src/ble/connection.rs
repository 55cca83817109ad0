//! Connection Management
//!
//! Tracks live BLE connections for the prepare engine.
//! Provides connection index allocation, handle mapping, cached connection
//! parameters and event forwarding to application tasks.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Channel, Receiver, Sender};

/// Maximum number of simultaneous connections
pub const MAX_CONNECTIONS: usize = 4;

/// Connection interval unit (1.25 ms)
pub const CONN_INTERVAL_UNIT_US: u32 = 1_250;

/// Supervision timeout unit (10 ms)
pub const SUPERVISION_TIMEOUT_UNIT_US: u32 = 10_000;

/// Highest valid HCI connection handle
pub const MAX_CONN_HANDLE: u16 = 0x0EFF;

/// Depth of the application event queue
pub const CONNECTION_EVENT_QUEUE: usize = 8;

/// Weak reference to a live connection: its stable index plus HCI handle.
///
/// Holding a `ConnRef` does not keep the connection alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnRef {
    index: u8,
    handle: u16,
}

impl ConnRef {
    pub const fn new(index: u8, handle: u16) -> Self {
        Self { index, handle }
    }

    /// Connection index, `0..MAX_CONNECTIONS`
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// HCI connection handle
    pub const fn handle(&self) -> u16 {
        self.handle
    }
}

/// Local role on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Central,
    Peripheral,
}

/// Connection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionParams {
    /// Connection interval (units of 1.25ms)
    pub interval: u16,
    /// Peripheral latency
    pub latency: u16,
    /// Supervision timeout (units of 10ms)
    pub supervision_timeout: u16,
}

impl ConnectionParams {
    pub const fn new(interval: u16, latency: u16, supervision_timeout: u16) -> Self {
        Self {
            interval,
            latency,
            supervision_timeout,
        }
    }

    /// Connection interval in microseconds
    pub const fn interval_us(&self) -> u32 {
        self.interval as u32 * CONN_INTERVAL_UNIT_US
    }

    /// Supervision timeout in microseconds
    pub const fn supervision_timeout_us(&self) -> u32 {
        self.supervision_timeout as u32 * SUPERVISION_TIMEOUT_UNIT_US
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            interval: 24, // 30ms
            latency: 0,
            supervision_timeout: 400, // 4s
        }
    }
}

/// Connection information
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionInfo {
    pub conn: ConnRef,
    pub role: Role,
    pub params: ConnectionParams,
}

/// Connection lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionEvent {
    Connected {
        handle: u16,
        role: Role,
        params: ConnectionParams,
    },
    Disconnected {
        handle: u16,
        reason: u8,
    },
    ParamsUpdated {
        handle: u16,
        params: ConnectionParams,
    },
}

impl ConnectionEvent {
    /// HCI handle the event refers to
    pub fn handle(&self) -> u16 {
        match self {
            ConnectionEvent::Connected { handle, .. }
            | ConnectionEvent::Disconnected { handle, .. }
            | ConnectionEvent::ParamsUpdated { handle, .. } => *handle,
        }
    }
}

/// Connection management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionError {
    ConnectionNotFound,
    ConnectionMapFull,
    AlreadyConnected,
    InvalidHandle,
}

/// Answers "what is this connection's current interval?"
pub trait ConnectionInfoSource {
    /// Current connection interval in microseconds, or `None` if the
    /// connection is unknown.
    fn conn_interval_us(&self, conn: ConnRef) -> Option<u32>;
}

type EventSender = Sender<'static, CriticalSectionRawMutex, ConnectionEvent, CONNECTION_EVENT_QUEUE>;

/// Connection manager state
pub struct ConnectionManager {
    /// Active connections indexed by connection index
    connections: [Option<ConnectionInfo>; MAX_CONNECTIONS],
    /// Event sender for forwarding to application tasks
    event_sender: Option<EventSender>,
}

impl ConnectionManager {
    pub const fn new() -> Self {
        Self {
            connections: [None; MAX_CONNECTIONS],
            event_sender: None,
        }
    }

    /// Set the event sender for forwarding events to application tasks
    pub fn set_event_sender(&mut self, sender: EventSender) {
        self.event_sender = Some(sender);
    }

    /// Add a new connection, assigning it the lowest free index
    pub fn add_connection(
        &mut self,
        handle: u16,
        role: Role,
        params: ConnectionParams,
    ) -> Result<ConnRef, ConnectionError> {
        if handle > MAX_CONN_HANDLE {
            error!("CONNECTION: Invalid connection handle {}", handle);
            return Err(ConnectionError::InvalidHandle);
        }

        if self.find(handle).is_some() {
            error!("CONNECTION: Connection {} already registered", handle);
            return Err(ConnectionError::AlreadyConnected);
        }

        let Some(index) = self.connections.iter().position(Option::is_none) else {
            error!("CONNECTION: Failed to add connection {} - map full", handle);
            return Err(ConnectionError::ConnectionMapFull);
        };

        let conn = ConnRef::new(index as u8, handle);
        self.connections[index] = Some(ConnectionInfo { conn, role, params });

        debug!(
            "CONNECTION: Added connection {} at index {} (interval {} us)",
            handle,
            index,
            params.interval_us()
        );

        self.forward(ConnectionEvent::Connected { handle, role, params });

        Ok(conn)
    }

    /// Remove a connection
    pub fn remove_connection(&mut self, handle: u16, reason: u8) -> Result<ConnRef, ConnectionError> {
        let Some(index) = self.find(handle) else {
            error!("CONNECTION: Attempted to remove unknown connection {}", handle);
            return Err(ConnectionError::ConnectionNotFound);
        };

        let conn = ConnRef::new(index as u8, handle);
        self.connections[index] = None;

        debug!("CONNECTION: Removed connection {} (reason: {})", handle, reason);

        self.forward(ConnectionEvent::Disconnected { handle, reason });

        Ok(conn)
    }

    /// Update connection parameters
    pub fn update_params(&mut self, handle: u16, params: ConnectionParams) -> Result<ConnRef, ConnectionError> {
        let Some(index) = self.find(handle) else {
            error!(
                "CONNECTION: Attempted to update params for unknown connection {}",
                handle
            );
            return Err(ConnectionError::ConnectionNotFound);
        };

        let info = self.connections[index]
            .as_mut()
            .ok_or(ConnectionError::ConnectionNotFound)?;
        info.params = params;
        let conn = info.conn;

        debug!(
            "CONNECTION: Updated parameters for connection {} (interval {} us)",
            handle,
            params.interval_us()
        );

        self.forward(ConnectionEvent::ParamsUpdated { handle, params });

        Ok(conn)
    }

    /// Get connection info by handle
    pub fn get_connection(&self, handle: u16) -> Option<&ConnectionInfo> {
        self.find(handle).and_then(|index| self.connections[index].as_ref())
    }

    /// Resolve a handle to its connection reference
    pub fn conn_ref(&self, handle: u16) -> Option<ConnRef> {
        self.get_connection(handle).map(|info| info.conn)
    }

    /// Check if a connection exists
    pub fn is_connected(&self, handle: u16) -> bool {
        self.find(handle).is_some()
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_some()).count()
    }

    /// Get all active connection handles
    pub fn active_handles(&self) -> impl Iterator<Item = u16> + '_ {
        self.connections.iter().flatten().map(|info| info.conn.handle())
    }

    fn find(&self, handle: u16) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| matches!(c, Some(info) if info.conn.handle() == handle))
    }

    fn forward(&self, event: ConnectionEvent) {
        if let Some(sender) = &self.event_sender {
            if sender.try_send(event).is_err() {
                error!("CONNECTION: Failed to forward event - queue full");
            }
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionInfoSource for ConnectionManager {
    fn conn_interval_us(&self, conn: ConnRef) -> Option<u32> {
        match self.connections.get(conn.index() as usize)? {
            Some(info) if info.conn == conn => Some(info.params.interval_us()),
            _ => None,
        }
    }
}

/// Global connection manager instance
static CONNECTION_MANAGER: Mutex<CriticalSectionRawMutex, RefCell<ConnectionManager>> =
    Mutex::new(RefCell::new(ConnectionManager::new()));

/// Initialize the connection manager and hook up event forwarding
pub fn init() {
    with_connection_manager(|mgr| {
        *mgr = ConnectionManager::new();
        mgr.set_event_sender(connection_event_sender());
    });
}

/// Access the global connection manager.
///
/// `f` runs inside a critical section and must not call back into this
/// function.
pub fn with_connection_manager<F, R>(f: F) -> R
where
    F: FnOnce(&mut ConnectionManager) -> R,
{
    CONNECTION_MANAGER.lock(|mgr| f(&mut mgr.borrow_mut()))
}

/// [`ConnectionInfoSource`] backed by the global connection manager
pub struct GlobalConnections;

impl ConnectionInfoSource for GlobalConnections {
    fn conn_interval_us(&self, conn: ConnRef) -> Option<u32> {
        with_connection_manager(|mgr| mgr.conn_interval_us(conn))
    }
}

/// Event channel for connection events
pub static CONNECTION_EVENT_CHANNEL: Channel<CriticalSectionRawMutex, ConnectionEvent, CONNECTION_EVENT_QUEUE> =
    Channel::new();

/// Get the connection event receiver
pub fn connection_event_receiver() -> Receiver<'static, CriticalSectionRawMutex, ConnectionEvent, CONNECTION_EVENT_QUEUE> {
    CONNECTION_EVENT_CHANNEL.receiver()
}

/// Get the connection event sender
pub fn connection_event_sender() -> EventSender {
    CONNECTION_EVENT_CHANNEL.sender()
}
