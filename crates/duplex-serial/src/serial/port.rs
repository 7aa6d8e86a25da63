//! Opening a serial port as a duplex channel.

use crate::serial::connector::ExclusiveConnector;
use crate::serial::transport::SerialTransport;
use crate::serial::types::{SerialSettings, DEFAULT_BAUD_RATE};
use duplex_core::{
    spawn_channel, Channel, ChannelError, ChannelEvent, ChannelOptions, ConnectErrorCallback, Connection,
    Endpoint, ParserConfig, ReceiveErrorPolicy,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Options for [`open_port`].
pub struct SerialOptions {
    pub baud_rate: u32,
    pub parser: ParserConfig,
    pub receive_errors: ReceiveErrorPolicy,
    /// Receives a failed connect instead of the event stream.
    pub on_connect_error: Option<ConnectErrorCallback>,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            parser: ParserConfig::Raw,
            receive_errors: ReceiveErrorPolicy::Emit,
            on_connect_error: None,
        }
    }
}

impl fmt::Debug for SerialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialOptions")
            .field("baud_rate", &self.baud_rate)
            .field("parser", &self.parser)
            .field("receive_errors", &self.receive_errors)
            .field("on_connect_error", &self.on_connect_error.is_some())
            .finish()
    }
}

impl From<SerialSettings> for SerialOptions {
    fn from(s: SerialSettings) -> Self {
        Self {
            baud_rate: s.baud_rate,
            parser: s.parser,
            receive_errors: s.receive_errors,
            on_connect_error: None,
        }
    }
}

impl SerialOptions {
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    pub fn receive_errors(mut self, policy: ReceiveErrorPolicy) -> Self {
        self.receive_errors = policy;
        self
    }

    pub fn on_connect_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(ChannelError) + Send + 'static,
    {
        self.on_connect_error = Some(Box::new(callback));
        self
    }
}

/// Open `path` exclusively and wrap it in a channel.
///
/// Returns as soon as the channel task is running; the outcome of the
/// connect arrives as `Open` or as an error followed by `Close`.
pub fn open_port<T>(
    transport: Arc<T>,
    path: &str,
    options: SerialOptions,
) -> Result<(Channel, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError>
where
    T: SerialTransport + ?Sized + 'static,
{
    let connector = Arc::new(ExclusiveConnector::new(transport));
    open_port_with(connector, path, options)
}

/// Like [`open_port`], sharing `connector` so that concurrent opens of the
/// same path are serialized.
pub fn open_port_with<T>(
    connector: Arc<ExclusiveConnector<T>>,
    path: &str,
    options: SerialOptions,
) -> Result<(Channel, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError>
where
    T: SerialTransport + ?Sized + 'static,
{
    let transport = Arc::clone(connector.transport());
    let target = path.to_string();
    let baud_rate = options.baud_rate;

    let establish = async move {
        let info = connector
            .connect(&target, baud_rate)
            .await
            .map_err(ChannelError::connect)?;
        Ok::<_, ChannelError>(Connection::new(info.connection_id).with_remote(Endpoint::device(info.path)))
    };

    let channel_options = ChannelOptions {
        label: format!("serial:{}", path),
        parser: options.parser,
        receive_errors: options.receive_errors,
        on_connect_error: options.on_connect_error,
    };
    spawn_channel(transport, establish, channel_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::transport::SimulatedSerialTransport;
    use bytes::Bytes;
    use duplex_core::{ChannelErrorKind, ChannelState};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn next_close(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut seen = Vec::new();
        while let Some(ev) = events.recv().await {
            let done = ev == ChannelEvent::Close;
            seen.push(ev);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn open_write_and_receive_lines() {
        let t = SimulatedSerialTransport::new();
        let (port, mut events) = open_port(
            Arc::clone(&t),
            "/dev/ttyACM0",
            SerialOptions::default().parser(ParserConfig::readline()),
        )
        .unwrap();

        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        let h = port.handle().unwrap();
        assert_eq!(port.remote_endpoint(), Some(&Endpoint::device("/dev/ttyACM0")));
        assert_eq!(t.connect_log()[0].1.bitrate, 115_200);
        assert_eq!(t.connect_log()[0].1.name, "SP_/dev/ttyACM0");

        port.write("$I\n").unwrap();
        t.core().wait_for_sends(1).await;
        assert_eq!(t.core().sent_to(h), vec![Bytes::from_static(b"$I\n")]);

        t.core().inject_receive(h, &b"[VER:1.1h]\r\nok\r"[..]);
        t.core().inject_receive(h, &b"\n"[..]);
        assert_eq!(events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"[VER:1.1h]"))));
        assert_eq!(events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"ok"))));
    }

    #[tokio::test]
    async fn banner_sent_on_connect_is_delivered() {
        let t = SimulatedSerialTransport::new();
        t.greet_on_connect("/dev/ttyUSB0", &b"Grbl 1.1f ['$' for help]\r\n"[..]);
        let (_port, mut events) = open_port(
            Arc::clone(&t),
            "/dev/ttyUSB0",
            SerialOptions::default().parser(ParserConfig::readline()),
        )
        .unwrap();

        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"Grbl 1.1f ['$' for help]")))
        );
    }

    #[tokio::test]
    async fn reopening_a_path_disconnects_the_old_handle() {
        let t = SimulatedSerialTransport::new();
        let (first, mut first_events) = open_port(Arc::clone(&t), "COM3", SerialOptions::default()).unwrap();
        assert_eq!(first_events.recv().await, Some(ChannelEvent::Open));
        let old = first.handle().unwrap();

        let (second, mut second_events) = open_port(Arc::clone(&t), "COM3", SerialOptions::default()).unwrap();
        assert_eq!(second_events.recv().await, Some(ChannelEvent::Open));

        assert_eq!(t.connections_to("COM3").len(), 1);
        assert_eq!(t.core().released(), vec![old]);
        assert_ne!(second.handle(), Some(old));

        // The stale channel hears about it and ends.
        let tail = next_close(&mut first_events).await;
        assert!(matches!(&tail[0], ChannelEvent::Error(e) if e.kind == ChannelErrorKind::Receive));
        assert_eq!(tail.last(), Some(&ChannelEvent::Close));
        assert_eq!(second.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn ordered_single_in_flight_writes() {
        let t = SimulatedSerialTransport::new();
        t.core().pause_sends();
        let (port, mut events) = open_port(Arc::clone(&t), "COM1", SerialOptions::default()).unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        let h = port.handle().unwrap();

        port.write("AA").unwrap();
        port.write("BB").unwrap();
        t.core().wait_for_sends(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(t.core().sent_to(h), vec![Bytes::from_static(b"AA")]);

        t.core().release_sends(1);
        t.core().wait_for_sends(2).await;
        assert_eq!(t.core().sent_to(h), vec![Bytes::from_static(b"AA"), Bytes::from_static(b"BB")]);
        t.core().resume_sends();
    }

    #[tokio::test]
    async fn second_of_three_writes_fails() {
        let t = SimulatedSerialTransport::new();
        t.core().fail_send_at(1);
        let (port, mut events) = open_port(Arc::clone(&t), "COM1", SerialOptions::default()).unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        let h = port.handle().unwrap();

        for w in ["G0 X0", "G0 X1", "G0 X2"] {
            port.write(w).unwrap();
        }
        let tail = next_close(&mut events).await;
        assert_eq!(tail.len(), 2);
        assert!(matches!(&tail[0], ChannelEvent::Error(e) if e.kind == ChannelErrorKind::Send));
        let sent = t.core().sent_to(h);
        assert_eq!(sent.len(), 2);
        assert!(!sent.contains(&Bytes::from_static(b"G0 X2")));
        assert!(!t.core().is_live(h));
    }

    #[tokio::test]
    async fn close_twice_is_one_close() {
        let t = SimulatedSerialTransport::new();
        let (port, mut events) = open_port(Arc::clone(&t), "COM1", SerialOptions::default()).unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        port.close();
        port.close();
        assert_eq!(next_close(&mut events).await, vec![ChannelEvent::Close]);
        assert!(events.recv().await.is_none());
        assert!(t.connections_to("COM1").is_empty());
    }

    #[tokio::test]
    async fn connect_error_reaches_callback() {
        let t = SimulatedSerialTransport::new();
        t.fail_connect("COM7", "Access is denied.");
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let options = SerialOptions::default().on_connect_error(move |e| {
            *sink.lock().unwrap() = Some(e);
        });

        let (_port, mut events) = open_port(Arc::clone(&t), "COM7", options).unwrap();
        assert_eq!(next_close(&mut events).await, vec![ChannelEvent::Close]);

        let err = seen.lock().unwrap().take().unwrap();
        assert_eq!(err.kind, ChannelErrorKind::Connect);
        assert!(err.message.contains("Access is denied."));
    }

    #[tokio::test]
    async fn connect_error_without_callback_is_an_event() {
        let t = SimulatedSerialTransport::new();
        t.fail_connect("COM7", "busy");
        let (_port, mut events) = open_port(Arc::clone(&t), "COM7", SerialOptions::default()).unwrap();
        let all = next_close(&mut events).await;
        assert_eq!(all.len(), 2);
        assert!(matches!(&all[0], ChannelEvent::Error(e) if e.kind == ChannelErrorKind::Connect));
    }

    #[test]
    fn options_from_settings() {
        let settings = SerialSettings {
            baud_rate: 250_000,
            parser: ParserConfig::readline_with("\n"),
            receive_errors: ReceiveErrorPolicy::Log,
        };
        let options = SerialOptions::from(settings);
        assert_eq!(options.baud_rate, 250_000);
        assert_eq!(options.receive_errors, ReceiveErrorPolicy::Log);
        assert!(options.on_connect_error.is_none());
    }
}
