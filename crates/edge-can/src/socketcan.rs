//! SocketCAN raw-socket frame source

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions};
use tracing::{debug, warn};

use crate::config::FrameFilter;
use crate::error::TransportError;
use crate::source::{CanFrameSource, RawFrame};

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// Raw CAN socket bound to one interface
pub struct SocketCanSource {
    interface: String,
    socket: Arc<Mutex<CanSocket>>,
}

impl SocketCanSource {
    pub fn open(interface: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                interface, e
            ))
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        debug!(interface = %interface, "Opened raw CAN socket");

        Ok(Self {
            interface: interface.to_string(),
            socket: Arc::new(Mutex::new(socket)),
        })
    }
}

#[async_trait]
impl CanFrameSource for SocketCanSource {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<RawFrame>, TransportError> {
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || read_until(&socket, timeout))
            .await
            .map_err(|e| TransportError::ReceiveFailed(format!("CAN read task join error: {}", e)))?
    }

    fn set_filters(&mut self, filters: &[FrameFilter]) -> Result<(), TransportError> {
        let socket = self.socket.lock();
        let result = if filters.is_empty() {
            socket.set_filter_accept_all()
        } else {
            let kernel: Vec<CanFilter> = filters.iter().map(to_kernel_filter).collect();
            socket.set_filters(&kernel)
        };
        result.map_err(|e| TransportError::InvalidConfig(format!("Failed to set CAN filters: {}", e)))
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

fn to_kernel_filter(filter: &FrameFilter) -> CanFilter {
    if filter.extended {
        CanFilter::new(filter.id | CAN_EFF_FLAG, CAN_EFF_MASK | CAN_EFF_FLAG)
    } else {
        CanFilter::new(filter.id, CAN_SFF_MASK | CAN_EFF_FLAG)
    }
}

/// Poll the non-blocking socket until a data frame arrives or `timeout` elapses.
fn read_until(socket: &Mutex<CanSocket>, timeout: Duration) -> Result<Option<RawFrame>, TransportError> {
    let deadline = Instant::now() + timeout;

    loop {
        if deadline.saturating_duration_since(Instant::now()).is_zero() {
            return Ok(None);
        }

        let read = socket.lock().read_frame();
        match read {
            Ok(CanFrame::Error(_)) => {
                debug!("Skipping CAN error frame");
            }
            Ok(frame) => {
                return Ok(Some(RawFrame {
                    id: frame.raw_id(),
                    extended: frame.is_extended(),
                    data: frame.data().to_vec(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                }));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                warn!(error = %e, "SocketCAN read error");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}
