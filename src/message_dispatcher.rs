use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::error::TransportError;

/// The application-facing side of a connection: released messages go up
///  through [MessageDispatcher::deliver], and the single fatal notification on
///  teardown goes through [MessageDispatcher::on_connection_failed].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn deliver(&self, msg_buf: &[u8]);

    async fn on_connection_failed(&self, error: TransportError);
}
