use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the node is connected to the network.
pub trait NetworkStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Connectivity state set by whoever owns the network connection.
#[derive(Debug, Default)]
pub struct ConnectivityFlag {
    connected: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl NetworkStatus for ConnectivityFlag {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
