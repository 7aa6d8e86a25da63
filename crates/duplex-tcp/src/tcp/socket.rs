//! Accepted TCP sockets as duplex channels.

use crate::tcp::transport::SocketTransport;
use crate::tcp::types::{SocketInfo, SocketSettings};
use duplex_core::{spawn_channel, Channel, ChannelError, ChannelEvent, ChannelOptions, Connection};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Wrap an already-connected socket in a channel.
///
/// The handle exists, so the channel opens straight away; it registers its
/// route and then unpauses the socket.
pub fn wrap_socket<T>(
    transport: Arc<T>,
    info: &SocketInfo,
    settings: &SocketSettings,
) -> Result<(Channel, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError>
where
    T: SocketTransport + ?Sized + 'static,
{
    let mut connection = Connection::new(info.socket_id);
    connection.local = info.local.clone();
    connection.remote = info.peer.clone();

    let label = match &info.peer {
        Some(peer) => format!("tcp:{}", peer),
        None => format!("tcp:{}", info.socket_id),
    };
    let options = ChannelOptions::new(label)
        .with_parser(settings.parser.clone())
        .with_receive_errors(settings.receive_errors);

    spawn_channel(transport, async move { Ok(connection) }, options)
}
