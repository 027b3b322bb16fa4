use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction for putting one datagram on the wire towards the connection's
///  peer, introduced to facilitate mocking the I/O part away for testing.
///
/// Sending is fire-and-forget: loss is what the reliability layer exists to
///  handle, so send errors are logged and swallowed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, datagram_buf: &[u8]);
}

/// A connected UDP socket is the production implementation.
#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, datagram_buf: &[u8]) {
        trace!("UDP socket: sending datagram of {} bytes", datagram_buf.len());

        if let Err(e) = self.send(datagram_buf).await {
            error!("error sending UDP datagram: {}", e);
        }
    }
}
