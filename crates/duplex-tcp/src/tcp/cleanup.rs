//! Startup cleanup of server sockets.

use crate::tcp::transport::SocketTransport;
use duplex_core::{ChannelError, TransportError};

/// Close every server socket the transport knows about.
///
/// Only servers the transport itself tracks are seen.
/// [`TokioSocketTransport`](crate::tcp::system::TokioSocketTransport) only
/// knows its own process's listeners, so at startup it finds nothing; ports
/// held by another process are not touched.  Returns how many servers were
/// closed.
pub async fn close_all_servers<T>(transport: &T) -> Result<usize, TransportError>
where
    T: SocketTransport + ?Sized,
{
    let mut closed = 0;
    for server in transport.servers().await? {
        match transport.close_server(server.socket_id).await {
            Ok(()) => closed += 1,
            Err(e) => log::warn!(
                "[listener:{}] {}",
                server.socket_id,
                ChannelError::cleanup(e).with_handle(server.socket_id)
            ),
        }
    }
    if closed > 0 {
        log::info!("[tcp] closed {} leftover server socket(s)", closed);
    }
    Ok(closed)
}
