//! Serial transport backed by the `serialport` crate.
//!
//! Each connection gets a blocking reader thread that pushes whatever it
//! reads into the demultiplexer.  The thread starts on `resume`, so input
//! that arrives before the channel is listening waits in the OS buffer.
//! Writes run on tokio's blocking pool.

use crate::serial::transport::SerialTransport;
use crate::serial::types::*;
use bytes::Bytes;
use duplex_core::{Demultiplexer, HandleId, Transport, TransportError, TransportErrorKind, TransportEvent};
use serialport::{SerialPort, SerialPortType};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const READ_BUFFER: usize = 4096;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Map a `serialport` error onto the transport taxonomy.
pub fn serial_error(e: serialport::Error) -> TransportError {
    let kind = match e.kind {
        serialport::ErrorKind::NoDevice => TransportErrorKind::NotFound,
        serialport::ErrorKind::InvalidInput => TransportErrorKind::Rejected,
        serialport::ErrorKind::Io(io) => {
            return TransportError::from(std::io::Error::new(io, e.description));
        }
        serialport::ErrorKind::Unknown => TransportErrorKind::Io,
    };
    TransportError::new(kind, e.description)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct OpenPort {
    info: ConnectionInfo,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    /// Read half, until `resume` hands it to the reader thread.
    reader: Option<Box<dyn SerialPort>>,
    stop: Arc<AtomicBool>,
}

pub struct SystemSerialTransport {
    demux: Demultiplexer,
    next_id: AtomicU32,
    ports: Mutex<HashMap<HandleId, OpenPort>>,
    read_timeout: Duration,
}

impl Default for SystemSerialTransport {
    fn default() -> Self {
        Self {
            demux: Demultiplexer::new(),
            next_id: AtomicU32::new(1),
            ports: Mutex::new(HashMap::new()),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SystemSerialTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Poll interval of the reader threads; bounds how long a released
    /// port stays open on the OS side.
    pub fn with_read_timeout(read_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            read_timeout,
            ..Self::default()
        })
    }

    /// Take ownership of an opened port.  Nothing is read until `resume`.
    fn adopt(&self, path: &str, options: &ConnectOptions, mut port: Box<dyn SerialPort>) -> Result<ConnectionInfo, TransportError> {
        port.set_timeout(self.read_timeout).map_err(serial_error)?;
        let reader = port.try_clone().map_err(serial_error)?;

        let handle = HandleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ConnectionInfo {
            connection_id: handle,
            name: options.name.clone(),
            path: path.to_string(),
            bitrate: options.bitrate,
        };
        lock(&self.ports).insert(
            handle,
            OpenPort {
                info: info.clone(),
                writer: Arc::new(Mutex::new(port)),
                reader: Some(reader),
                stop: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(info)
    }

    fn spawn_reader(&self, handle: HandleId, path: &str, mut port: Box<dyn SerialPort>, stop: Arc<AtomicBool>) -> Result<(), TransportError> {
        let demux = self.demux.clone();
        let label = path.to_string();
        thread::Builder::new()
            .name(format!("serial-reader-{}", handle))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER];
                while !stop.load(Ordering::SeqCst) {
                    match port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            demux.route(TransportEvent::Receive {
                                handle,
                                data: Bytes::copy_from_slice(&buf[..n]),
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            if !stop.load(Ordering::SeqCst) {
                                log::warn!("[serial:{}] read failed: {}", label, e);
                                demux.route(TransportEvent::ReceiveError {
                                    handle,
                                    error: e.to_string(),
                                });
                            }
                            break;
                        }
                    }
                }
                log::trace!("[serial:{}] reader for {} stopped", label, handle);
            })
            .map(|_| ())
            .map_err(TransportError::from)
    }
}

#[async_trait::async_trait]
impl Transport for SystemSerialTransport {
    fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    async fn send(&self, handle: HandleId, data: Bytes) -> Result<(), TransportError> {
        let writer = lock(&self.ports)
            .get(&handle)
            .map(|p| Arc::clone(&p.writer))
            .ok_or_else(|| TransportError::not_found(handle))?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut port = lock(&writer);
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(|e| TransportError::io(e.to_string()))?
        .map_err(TransportError::from)
    }

    async fn release(&self, handle: HandleId) -> Result<(), TransportError> {
        let port = lock(&self.ports)
            .remove(&handle)
            .ok_or_else(|| TransportError::not_found(handle))?;
        port.stop.store(true, Ordering::SeqCst);
        log::debug!("[serial:{}] disconnected {}", port.info.path, handle);
        self.demux.route(TransportEvent::ReceiveError {
            handle,
            error: "disconnected".to_string(),
        });
        Ok(())
    }

    async fn resume(&self, handle: HandleId) -> Result<(), TransportError> {
        let (path, reader, stop) = {
            let mut ports = lock(&self.ports);
            let port = ports.get_mut(&handle).ok_or_else(|| TransportError::not_found(handle))?;
            let Some(reader) = port.reader.take() else {
                return Ok(());
            };
            (port.info.path.clone(), reader, Arc::clone(&port.stop))
        };
        self.spawn_reader(handle, &path, reader, stop)
    }
}

#[async_trait::async_trait]
impl SerialTransport for SystemSerialTransport {
    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| TransportError::io(e.to_string()))?
            .map_err(serial_error)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let device = DeviceInfo::new(p.port_name);
                match p.port_type {
                    SerialPortType::UsbPort(usb) => {
                        let name = usb.product.or(usb.manufacturer);
                        let device = device.usb(usb.vid, usb.pid);
                        match name {
                            Some(name) => device.named(name),
                            None => device,
                        }
                    }
                    _ => device,
                }
            })
            .collect())
    }

    async fn get_connections(&self) -> Result<Vec<ConnectionInfo>, TransportError> {
        Ok(lock(&self.ports).values().map(|p| p.info.clone()).collect())
    }

    async fn connect(&self, path: &str, options: &ConnectOptions) -> Result<ConnectionInfo, TransportError> {
        let target = path.to_string();
        let bitrate = options.bitrate;
        let timeout = self.read_timeout;
        let port = tokio::task::spawn_blocking(move || serialport::new(target, bitrate).timeout(timeout).open())
            .await
            .map_err(|e| TransportError::io(e.to_string()))?
            .map_err(serial_error)?;

        let info = self.adopt(path, options, port)?;
        log::info!("[serial:{}] opened at {} baud as {}", path, bitrate, info.connection_id);
        Ok(info)
    }
}
