//! The duplex channel: one connection, one task, one event stream.
//!
//! [`spawn_channel`] starts a task that drives the lifecycle
//! `Connecting → Open → Closing → Closed` around a single transport handle.
//! The task owns the channel's [`WriteQueue`] and [`FrameParser`]; the
//! returned [`Channel`] handle only sends it commands, so every mutation of
//! a channel is serialized on that task.

use crate::demux::InboundEvent;
use crate::error::{ChannelError, TransportError, TransportErrorKind};
use crate::parser::{FrameParser, ParserConfig};
use crate::transport::Transport;
use crate::types::{ChannelEvent, ChannelState, Connection, Endpoint, HandleId};
use crate::write_queue::WriteQueue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What to do with a receive fault before the channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiveErrorPolicy {
    /// Surface it as `ChannelEvent::Error`.
    #[default]
    Emit,
    /// Only write it to the log.
    Log,
}

/// Receives the connect failure instead of the event stream.
pub type ConnectErrorCallback = Box<dyn FnOnce(ChannelError) + Send + 'static>;

#[derive(Default)]
pub struct ChannelOptions {
    /// Prefix for log lines, e.g. `serial:/dev/ttyACM0`.
    pub label: String,
    pub parser: ParserConfig,
    pub receive_errors: ReceiveErrorPolicy,
    pub on_connect_error: Option<ConnectErrorCallback>,
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("label", &self.label)
            .field("parser", &self.parser)
            .field("receive_errors", &self.receive_errors)
            .field("on_connect_error", &self.on_connect_error.is_some())
            .finish()
    }
}

impl ChannelOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_receive_errors(mut self, policy: ReceiveErrorPolicy) -> Self {
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

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
enum ChannelCommand {
    Write(Bytes),
    Close,
}

/// Consumer-side handle of a running channel.
///
/// Clones share the same channel.  Once every clone is dropped the channel
/// closes itself.
#[derive(Clone)]
pub struct Channel {
    label: Arc<str>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Receiver<ChannelState>,
    connection: Arc<OnceLock<Connection>>,
    close_requested: Arc<AtomicBool>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("handle", &self.handle())
            .finish()
    }
}

impl Channel {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue `data` for sending.  Never waits for the transport.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        if self.close_requested.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        self.commands
            .send(ChannelCommand::Write(data.into()))
            .map_err(|_| self.closed_error())
    }

    /// Request close.  Calling it again has no further effect.
    pub fn close(&self) {
        if !self.close_requested.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(ChannelCommand::Close);
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the channel reaches `target` or any later state.
    pub async fn wait_for_state(&self, target: ChannelState) -> ChannelState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s >= target).await.map(|s| *s);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }

    pub async fn closed(&self) {
        self.wait_for_state(ChannelState::Closed).await;
    }

    pub fn handle(&self) -> Option<HandleId> {
        self.connection.get().map(|c| c.handle)
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.connection.get().and_then(|c| c.local.as_ref())
    }

    pub fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.connection.get().and_then(|c| c.remote.as_ref())
    }

    fn closed_error(&self) -> ChannelError {
        match self.handle() {
            Some(handle) => ChannelError::closed().with_handle(handle),
            None => ChannelError::closed(),
        }
    }
}

/// Start a channel whose handle is produced by `establish`.
///
/// Only a bad parser configuration fails here; connect failures arrive
/// through the callback or the event stream.
pub fn spawn_channel<T, F>(
    transport: Arc<T>,
    establish: F,
    mut options: ChannelOptions,
) -> Result<(Channel, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError>
where
    T: Transport + ?Sized + 'static,
    F: Future<Output = Result<Connection, ChannelError>> + Send + 'static,
{
    let parser = FrameParser::new(&options.parser)?;
    let label: Arc<str> = Arc::from(options.label.as_str());
    let on_connect_error = options.on_connect_error.take();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
    let connection = Arc::new(OnceLock::new());
    let close_requested = Arc::new(AtomicBool::new(false));

    let runner = ChannelRunner {
        label: Arc::clone(&label),
        transport,
        parser,
        queue: WriteQueue::new(),
        receive_errors: options.receive_errors,
        commands: cmd_rx,
        events: event_tx,
        state: state_tx,
        connection: Arc::clone(&connection),
        close_requested: Arc::clone(&close_requested),
    };
    tokio::spawn(runner.run(establish, on_connect_error));

    let channel = Channel {
        label,
        commands: cmd_tx,
        state: state_rx,
        connection,
        close_requested,
    };
    Ok((channel, event_rx))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type SendTask = JoinHandle<Result<(), TransportError>>;

enum Exit {
    Requested,
    Failed,
}

struct ChannelRunner<T: ?Sized> {
    label: Arc<str>,
    transport: Arc<T>,
    parser: FrameParser,
    queue: WriteQueue,
    receive_errors: ReceiveErrorPolicy,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    connection: Arc<OnceLock<Connection>>,
    close_requested: Arc<AtomicBool>,
}

async fn next_completion(slot: &mut Option<SendTask>) -> Result<Result<(), TransportError>, JoinError> {
    match slot {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

impl<T> ChannelRunner<T>
where
    T: Transport + ?Sized + 'static,
{
    async fn run<F>(mut self, establish: F, on_connect_error: Option<ConnectErrorCallback>)
    where
        F: Future<Output = Result<Connection, ChannelError>> + Send,
    {
        tokio::pin!(establish);
        let mut close_early = false;

        // Writes arriving while connecting are queued; a close is remembered.
        let established = loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv(), if !close_early => match cmd {
                    Some(ChannelCommand::Write(buf)) => {
                        self.queue.enqueue(buf);
                    }
                    Some(ChannelCommand::Close) | None => close_early = true,
                },
                result = &mut establish => break result,
            }
        };
        // A close issued just before the connect finished still counts.
        while !close_early {
            match self.commands.try_recv() {
                Ok(ChannelCommand::Write(buf)) => {
                    self.queue.enqueue(buf);
                }
                Ok(ChannelCommand::Close) | Err(mpsc::error::TryRecvError::Disconnected) => close_early = true,
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }
        close_early |= self.close_requested.load(Ordering::SeqCst);

        let conn = match established {
            Ok(conn) => conn,
            Err(err) => {
                self.fail_connect(err, on_connect_error);
                self.finish();
                return;
            }
        };
        let handle = conn.handle;
        let _ = self.connection.set(conn);

        if close_early {
            log::debug!("[{}] close requested while connecting", self.label);
            self.shutdown(handle).await;
            return;
        }

        let mut inbound = self.transport.demux().register(handle);
        if let Err(e) = self.transport.resume(handle).await {
            self.transport.demux().unregister(handle);
            self.fail_connect(ChannelError::connect(e).with_handle(handle), on_connect_error);
            self.shutdown(handle).await;
            return;
        }

        self.set_state(ChannelState::Open);
        log::info!("[{}] open (handle {})", self.label, handle);
        self.emit(ChannelEvent::Open);

        let mut in_flight: Option<SendTask> = None;
        self.pump(handle, &mut in_flight);

        let exit = loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Write(buf)) => {
                        self.queue.enqueue(buf);
                        self.pump(handle, &mut in_flight);
                    }
                    Some(ChannelCommand::Close) | None => break Exit::Requested,
                },
                event = inbound.recv() => match event {
                    Some(_) if self.close_requested.load(Ordering::SeqCst) => break Exit::Requested,
                    Some(InboundEvent::Receive(data)) => self.deliver(&data),
                    Some(InboundEvent::ReceiveError(error)) => {
                        self.receive_failed(handle, error);
                        break Exit::Failed;
                    }
                    Some(InboundEvent::Accept(client)) => {
                        log::debug!("[{}] ignoring accept of {}", self.label, client);
                    }
                    None => {
                        self.receive_failed(handle, "event stream ended".to_string());
                        break Exit::Failed;
                    }
                },
                joined = next_completion(&mut in_flight) => {
                    in_flight = None;
                    let outcome = match joined {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(join_err) => Err(join_err.to_string()),
                    };
                    match outcome {
                        Ok(()) => {
                            self.queue.complete();
                            self.pump(handle, &mut in_flight);
                        }
                        Err(e) => {
                            log::warn!("[{}] send failed: {}", self.label, e);
                            self.emit(ChannelEvent::Error(ChannelError::send(e).with_handle(handle)));
                            break Exit::Failed;
                        }
                    }
                }
            }
        };

        if let Exit::Failed = exit {
            log::debug!("[{}] closing after failure", self.label);
        }
        drop(inbound);
        self.shutdown(handle).await;
    }

    fn emit(&self, event: ChannelEvent) {
        // The consumer may have dropped its receiver.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn deliver(&mut self, chunk: &[u8]) {
        let events = &self.events;
        self.parser.feed(chunk, |frame| {
            let _ = events.send(ChannelEvent::Data(frame));
        });
    }

    fn pump(&mut self, handle: HandleId, in_flight: &mut Option<SendTask>) {
        if in_flight.is_some() {
            return;
        }
        let writable = self.state.borrow().is_writable();
        if let Some(buf) = self.queue.flush(writable) {
            let transport = Arc::clone(&self.transport);
            *in_flight = Some(tokio::spawn(async move { transport.send(handle, buf).await }));
        }
    }

    fn receive_failed(&self, handle: HandleId, error: String) {
        let err = ChannelError::receive(error).with_handle(handle);
        match self.receive_errors {
            ReceiveErrorPolicy::Emit => {
                log::warn!("[{}] {}", self.label, err);
                self.emit(ChannelEvent::Error(err));
            }
            ReceiveErrorPolicy::Log => log::error!("[{}] {}", self.label, err),
        }
    }

    fn fail_connect(&self, err: ChannelError, callback: Option<ConnectErrorCallback>) {
        log::warn!("[{}] connect failed: {}", self.label, err);
        match callback {
            Some(cb) => cb(err),
            None => self.emit(ChannelEvent::Error(err)),
        }
    }

    async fn shutdown(&mut self, handle: HandleId) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.set_state(ChannelState::Closing);
        self.transport.demux().unregister(handle);

        let dropped = self.queue.abort();
        if dropped > 0 {
            log::debug!("[{}] dropped {} queued write(s)", self.label, dropped);
        }

        match self.transport.release(handle).await {
            Ok(()) => {}
            Err(e) if e.kind == TransportErrorKind::NotFound => {
                log::debug!("[{}] handle {} already released", self.label, handle);
            }
            Err(e) => {
                log::warn!("[{}] release failed: {}", self.label, e);
                self.emit(ChannelEvent::Error(ChannelError::disconnect(e).with_handle(handle)));
            }
        }
        self.finish();
        log::info!("[{}] closed", self.label);
    }

    fn finish(&mut self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.queue.abort();
        self.set_state(ChannelState::Closed);
        self.emit(ChannelEvent::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelErrorKind;
    use crate::simulated::SimulatedCore;
    use std::sync::Mutex;
    use std::time::Duration;

    fn open_on(
        core: &Arc<SimulatedCore>,
        options: ChannelOptions,
    ) -> (Channel, mpsc::UnboundedReceiver<ChannelEvent>, HandleId) {
        let handle = core.allocate();
        let (ch, events) = spawn_channel(
            Arc::clone(core),
            async move { Ok(Connection::new(handle)) },
            options,
        )
        .unwrap();
        (ch, events, handle)
    }

    async fn collect_until_close(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut out = Vec::new();
        while let Some(ev) = events.recv().await {
            let done = ev == ChannelEvent::Close;
            out.push(ev);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn open_then_data_then_close() {
        let core = Arc::new(SimulatedCore::new());
        let (ch, mut events, h) = open_on(&core, ChannelOptions::new("test"));

        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(ch.handle(), Some(h));

        core.inject_receive(h, &b"hello"[..]);
        assert_eq!(events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"hello"))));

        ch.close();
        assert_eq!(events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(ch.wait_for_state(ChannelState::Closed).await, ChannelState::Closed);
        assert_eq!(core.released(), vec![h]);
        assert!(!core.demux().is_registered(h));
    }

    #[tokio::test]
    async fn writes_are_sent_one_at_a_time_in_order() {
        let core = Arc::new(SimulatedCore::new());
        core.pause_sends();
        let (ch, mut events, h) = open_on(&core, ChannelOptions::new("order"));
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        ch.write(&b"AA"[..]).unwrap();
        ch.write(&b"BB"[..]).unwrap();
        core.wait_for_sends(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(core.sent_to(h), vec![Bytes::from_static(b"AA")]);

        core.release_sends(1);
        core.wait_for_sends(2).await;
        assert_eq!(
            core.sent_to(h),
            vec![Bytes::from_static(b"AA"), Bytes::from_static(b"BB")]
        );
        core.resume_sends();
        ch.close();
        ch.closed().await;
    }

    #[tokio::test]
    async fn writes_while_connecting_flush_after_open() {
        let core = Arc::new(SimulatedCore::new());
        let handle = core.allocate();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let (ch, mut events) = spawn_channel(
            Arc::clone(&core),
            async move {
                let _ = gate_rx.await;
                Ok(Connection::new(handle))
            },
            ChannelOptions::default(),
        )
        .unwrap();

        ch.write(&b"early"[..]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ch.state(), ChannelState::Connecting);
        assert!(core.sent().is_empty());

        gate_tx.send(()).unwrap();
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));
        core.wait_for_sends(1).await;
        assert_eq!(core.sent_to(handle), vec![Bytes::from_static(b"early")]);
    }

    #[tokio::test]
    async fn send_failure_emits_error_then_close() {
        let core = Arc::new(SimulatedCore::new());
        core.fail_send_at(1);
        let (ch, mut events, h) = open_on(&core, ChannelOptions::new("fail"));
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        for chunk in ["one", "two", "three"] {
            ch.write(chunk).unwrap();
        }
        let rest = collect_until_close(&mut events).await;
        assert_eq!(rest.len(), 2);
        match &rest[0] {
            ChannelEvent::Error(e) => assert_eq!(e.kind, ChannelErrorKind::Send),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rest[1], ChannelEvent::Close);
        assert_eq!(core.sent_to(h).len(), 2);
        assert_eq!(ch.write("four").unwrap_err().kind, ChannelErrorKind::Closed);
    }

    #[tokio::test]
    async fn close_twice_emits_one_close() {
        let core = Arc::new(SimulatedCore::new());
        let (ch, mut events, _h) = open_on(&core, ChannelOptions::default());
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        ch.close();
        ch.close();
        assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
        assert_eq!(events.recv().await, None);
        assert_eq!(core.released().len(), 1);
    }

    #[tokio::test]
    async fn receive_error_emits_then_closes() {
        let core = Arc::new(SimulatedCore::new());
        let (_ch, mut events, h) = open_on(&core, ChannelOptions::default());
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        core.inject_receive_error(h, "framing error");
        let rest = collect_until_close(&mut events).await;
        match &rest[0] {
            ChannelEvent::Error(e) => {
                assert_eq!(e.kind, ChannelErrorKind::Receive);
                assert_eq!(e.handle, Some(h));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rest.last(), Some(&ChannelEvent::Close));
    }

    #[tokio::test]
    async fn receive_error_log_policy_only_closes() {
        let core = Arc::new(SimulatedCore::new());
        let options = ChannelOptions::default().with_receive_errors(ReceiveErrorPolicy::Log);
        let (_ch, mut events, h) = open_on(&core, options);
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        core.inject_receive_error(h, "reset");
        assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
    }

    #[tokio::test]
    async fn connect_failure_goes_to_callback() {
        let core = Arc::new(SimulatedCore::new());
        let seen: Arc<Mutex<Vec<ChannelError>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let options = ChannelOptions::new("cb").on_connect_error(move |e| sink.lock().unwrap().push(e));

        let (ch, mut events) = spawn_channel(
            Arc::clone(&core),
            async { Err(ChannelError::connect("port busy")) },
            options,
        )
        .unwrap();

        assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(ch.handle().is_none());
    }

    #[tokio::test]
    async fn connect_failure_without_callback_is_an_event() {
        let core = Arc::new(SimulatedCore::new());
        let (_ch, mut events) = spawn_channel(
            Arc::clone(&core),
            async { Err(ChannelError::connect("no such device")) },
            ChannelOptions::default(),
        )
        .unwrap();

        let evs = collect_until_close(&mut events).await;
        assert_eq!(evs.len(), 2);
        assert!(matches!(&evs[0], ChannelEvent::Error(e) if e.kind == ChannelErrorKind::Connect));
        assert!(!evs.contains(&ChannelEvent::Open));
    }

    #[tokio::test]
    async fn close_while_connecting_releases_without_open() {
        let core = Arc::new(SimulatedCore::new());
        let handle = core.allocate();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let (ch, mut events) = spawn_channel(
            Arc::clone(&core),
            async move {
                let _ = gate_rx.await;
                Ok(Connection::new(handle))
            },
            ChannelOptions::default(),
        )
        .unwrap();

        ch.close();
        assert!(ch.write("late").is_err());
        gate_tx.send(()).unwrap();

        assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
        assert_eq!(core.released(), vec![handle]);
        assert!(core.sent().is_empty());
    }

    #[tokio::test]
    async fn close_before_first_poll_never_opens() {
        for _ in 0..20 {
            let core = Arc::new(SimulatedCore::new());
            let (ch, mut events, h) = open_on(&core, ChannelOptions::default());
            // The connect future is already resolved; the task has not run yet.
            ch.close();

            assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
            assert_eq!(core.released(), vec![h]);
            assert!(!core.demux().is_registered(h));
        }
    }

    #[tokio::test]
    async fn pending_data_is_dropped_after_close() {
        for _ in 0..20 {
            let core = Arc::new(SimulatedCore::new());
            let (ch, mut events, h) = open_on(&core, ChannelOptions::default());
            assert_eq!(events.recv().await, Some(ChannelEvent::Open));

            core.inject_receive(h, &b"late"[..]);
            ch.close();
            assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
        }
    }

    #[tokio::test]
    async fn failed_release_reports_disconnect_error() {
        let core = Arc::new(SimulatedCore::new());
        core.fail_releases(true);
        let (ch, mut events, _h) = open_on(&core, ChannelOptions::default());
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        ch.close();
        let evs = collect_until_close(&mut events).await;
        assert!(matches!(&evs[0], ChannelEvent::Error(e) if e.kind == ChannelErrorKind::Disconnect));
        assert_eq!(evs[1], ChannelEvent::Close);
    }

    #[tokio::test]
    async fn handle_released_elsewhere_closes_quietly() {
        let core = Arc::new(SimulatedCore::new());
        let (ch, mut events, h) = open_on(&core, ChannelOptions::default());
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        core.release(h).await.unwrap();
        ch.close();
        assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
    }

    #[tokio::test]
    async fn readline_parser_frames_inbound_chunks() {
        let core = Arc::new(SimulatedCore::new());
        let options = ChannelOptions::default().with_parser(ParserConfig::readline());
        let (_ch, mut events, h) = open_on(&core, options);
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        for chunk in ["foo\r\n", "ba", "r\r\n"] {
            core.inject_receive(h, chunk.as_bytes().to_vec());
        }
        assert_eq!(events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"foo"))));
        assert_eq!(events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"bar"))));
    }

    #[tokio::test]
    async fn dropping_every_handle_closes() {
        let core = Arc::new(SimulatedCore::new());
        let (ch, mut events, h) = open_on(&core, ChannelOptions::default());
        assert_eq!(events.recv().await, Some(ChannelEvent::Open));

        let clone = ch.clone();
        drop(ch);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(core.is_live(h));

        drop(clone);
        assert_eq!(collect_until_close(&mut events).await, vec![ChannelEvent::Close]);
        assert!(!core.is_live(h));
    }

    #[tokio::test]
    async fn bad_parser_config_fails_synchronously() {
        let core = Arc::new(SimulatedCore::new());
        let options = ChannelOptions::default().with_parser(ParserConfig::readline_with(""));
        let err = spawn_channel(core, async { Err(ChannelError::connect("unused")) }, options)
            .unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidConfig);
    }
}
