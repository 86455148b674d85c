use linkrelay_common::{ConnectionState, StatusHandle};

/// Shared state behind the HTTP routes.
#[derive(Debug, Clone)]
pub struct GatewayState {
    status: StatusHandle,
    monitored_channels: usize,
}

impl GatewayState {
    pub fn new(status: StatusHandle, monitored_channels: usize) -> Self {
        Self {
            status,
            monitored_channels,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.current()
    }

    pub fn monitored_channels(&self) -> usize {
        self.monitored_channels
    }
}
