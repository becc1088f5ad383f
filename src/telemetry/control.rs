//! Line protocol for the motor-controller link.
//!
//! Outbound: one `"<x>,<y>"` line per accepted target, or the `-1,-1` halt
//! sentinel while tracking is lost. Inbound: optional single-line replies
//! from the controller firmware; silence is normal.

use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_serial::SerialStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::detect::TargetPoint;

/// Halt sentinel understood by the controller firmware.
pub const HALT_SENTINEL: &str = "-1,-1";

/// Reply lines longer than this are garbage, not acks.
const MAX_LINE_LENGTH: usize = 256;

/// Format a target as a wire line (the codec appends the `\n`).
pub fn format_target(point: TargetPoint) -> String {
    format!("{},{}", point.x, point.y)
}

/// Framed line-protocol link to the motor controller.
///
/// Generic over the byte-stream transport so tests can run against an
/// in-memory pipe instead of the serial device.
pub struct ControlLink<T> {
    framed: Framed<T, LinesCodec>,
    ack_timeout: Duration,
}

impl ControlLink<SerialStream> {
    /// Open the serial device the controller is attached to.
    pub fn open_serial(path: &str, baud: u32, ack_timeout: Duration) -> Result<Self> {
        let stream = SerialStream::open(&tokio_serial::new(path, baud))?;
        Ok(Self::new(stream, ack_timeout))
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> ControlLink<T> {
    pub fn new(io: T, ack_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            ack_timeout,
        }
    }

    /// Send a steering target as `"<x>,<y>\n"`.
    pub async fn send_target(&mut self, point: TargetPoint) -> Result<()> {
        self.framed.send(format_target(point)).await?;
        Ok(())
    }

    /// Send the halt sentinel `"-1,-1\n"`.
    pub async fn send_halt(&mut self) -> Result<()> {
        self.framed.send(HALT_SENTINEL.to_string()).await?;
        Ok(())
    }

    /// Read one reply line if the controller sends one within the timeout.
    /// `None` when the controller stays silent or the line is unreadable.
    pub async fn read_ack(&mut self) -> Option<String> {
        match timeout(self.ack_timeout, self.framed.next()).await {
            Ok(Some(Ok(line))) => Some(line),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_format_target() {
        assert_eq!(format_target(TargetPoint::new(50, 360)), "50,360");
        assert_eq!(format_target(TargetPoint::new(0, 0)), "0,0");
    }

    #[test]
    fn test_halt_sentinel_matches_coordinate_format() {
        assert_eq!(format_target(TargetPoint::new(-1, -1)), HALT_SENTINEL);
    }

    #[tokio::test]
    async fn test_send_target_wire_format() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut link = ControlLink::new(near, Duration::from_millis(10));
        link.send_target(TargetPoint::new(50, 360)).await.unwrap();

        let mut buf = [0u8; 16];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"50,360\n");
    }

    #[tokio::test]
    async fn test_send_halt_wire_format() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut link = ControlLink::new(near, Duration::from_millis(10));
        link.send_halt().await.unwrap();

        let mut buf = [0u8; 16];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"-1,-1\n");
    }

    #[tokio::test]
    async fn test_read_ack_returns_reply_line() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut link = ControlLink::new(near, Duration::from_millis(100));
        far.write_all(b"OK\n").await.unwrap();

        assert_eq!(link.read_ack().await.as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn test_read_ack_times_out_quietly() {
        let (near, _far) = tokio::io::duplex(64);
        let mut link = ControlLink::new(near, Duration::from_millis(10));
        assert_eq!(link.read_ack().await, None);
    }
}
