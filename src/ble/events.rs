//! Connection Lifecycle Binding
//!
//! Applies connection lifecycle events to the connection registry and fans
//! them out to subscribers. Subscriptions are global: every listener passed
//! to [`dispatch`] sees every event, whether or not it cares about that
//! connection.

use crate::ble::connection::{ConnRef, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionParams};

/// Connection lifecycle hooks. All methods default to no-ops.
///
/// Hooks are called with the connection registry locked; they must not call
/// back into it.
pub trait ConnectionCallbacks {
    fn connected(&self, _conn: ConnRef, _params: &ConnectionParams) {}

    fn disconnected(&self, _conn: ConnRef, _reason: u8) {}

    fn params_updated(&self, _conn: ConnRef, _params: &ConnectionParams) {}
}

/// Apply `event` to `manager` and notify `listeners`.
///
/// Connects and parameter updates reach the registry before the listeners.
/// Disconnects reach the listeners first, while the connection index is
/// still assigned, and are forgotten afterwards.
pub fn dispatch(
    manager: &mut ConnectionManager,
    listeners: &[&dyn ConnectionCallbacks],
    event: &ConnectionEvent,
) -> Result<ConnRef, ConnectionError> {
    match *event {
        ConnectionEvent::Connected { handle, role, params } => {
            let conn = manager.add_connection(handle, role, params)?;
            for listener in listeners {
                listener.connected(conn, &params);
            }
            Ok(conn)
        }
        ConnectionEvent::ParamsUpdated { handle, params } => {
            let conn = manager.update_params(handle, params)?;
            for listener in listeners {
                listener.params_updated(conn, &params);
            }
            Ok(conn)
        }
        ConnectionEvent::Disconnected { handle, reason } => {
            let Some(conn) = manager.conn_ref(handle) else {
                warn!("EVENTS: Disconnect for unknown connection {}", handle);
                return Err(ConnectionError::ConnectionNotFound);
            };
            for listener in listeners {
                listener.disconnected(conn, reason);
            }
            manager.remove_connection(handle, reason)
        }
    }
}
