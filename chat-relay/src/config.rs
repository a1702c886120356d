use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{ensure, Result};

use crate::codec::{FrameCodec, DEFAULT_MAX_PAYLOAD};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Runtime settings for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the listener binds to.
    pub listen: SocketAddr,
    /// Largest accepted text or image payload, in bytes.
    pub max_payload: usize,
    /// Frames that may wait for a single client before it counts as too
    /// slow and is disconnected.
    pub outbound_queue: usize,
    /// Upper bound on writing one frame to a client. `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_payload > 0, "max payload must be at least one byte");
        ensure!(
            self.max_payload <= i32::MAX as usize,
            "max payload cannot exceed {} bytes",
            i32::MAX
        );
        ensure!(self.outbound_queue > 0, "outbound queue must hold at least one frame");
        if let Some(timeout) = self.write_timeout {
            ensure!(!timeout.is_zero(), "write timeout must be non-zero");
        }
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_payload(self.max_payload)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_payload: DEFAULT_MAX_PAYLOAD,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            write_timeout: None,
        }
    }
}
