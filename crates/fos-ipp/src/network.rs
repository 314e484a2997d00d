//! Network change notifications
//!
//! The OS notification source lives outside this crate. It either calls
//! [`NetworkChangeObserver::on_network_changed`] directly or publishes the
//! current connection type on a `watch` channel that
//! [`spawn_network_change_listener`] forwards.

use std::sync::Weak;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Physical connection type reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Unknown,
    Ethernet,
    Wifi,
    Cellular2G,
    Cellular3G,
    Cellular4G,
    Cellular5G,
    Bluetooth,
    /// No connectivity
    None,
}

impl ConnectionType {
    /// Check if the device has connectivity
    pub fn is_online(&self) -> bool {
        !matches!(self, ConnectionType::None)
    }

    /// Check if this is a cellular connection
    pub fn is_cellular(&self) -> bool {
        matches!(
            self,
            ConnectionType::Cellular2G
                | ConnectionType::Cellular3G
                | ConnectionType::Cellular4G
                | ConnectionType::Cellular5G
        )
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionType::Unknown => "unknown",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular2G => "2g",
            ConnectionType::Cellular3G => "3g",
            ConnectionType::Cellular4G => "4g",
            ConnectionType::Cellular5G => "5g",
            ConnectionType::Bluetooth => "bluetooth",
            ConnectionType::None => "none",
        };
        write!(f, "{}", name)
    }
}

/// Receiver of connectivity changes
pub trait NetworkChangeObserver: Send + Sync {
    /// Called whenever the connection type changes
    fn on_network_changed(&self, connection_type: ConnectionType);
}

/// Forward connection type changes from `rx` to `observer`
///
/// The task holds only a weak reference and exits once the observer is
/// dropped or the sender side closes. Values already marked seen on `rx`
/// are not replayed. Returns `None` outside a tokio runtime.
pub fn spawn_network_change_listener(
    observer: Weak<dyn NetworkChangeObserver>,
    mut rx: watch::Receiver<ConnectionType>,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = Handle::try_current() else {
        warn!("No async runtime available, network changes will not be observed");
        return None;
    };

    Some(runtime.spawn(async move {
        while rx.changed().await.is_ok() {
            let connection_type = *rx.borrow_and_update();

            let Some(observer) = observer.upgrade() else {
                debug!("Network observer dropped, stopping listener");
                return;
            };
            observer.on_network_changed(connection_type);
        }

        debug!("Network change source closed");
    }))
}
