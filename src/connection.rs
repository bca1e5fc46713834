use crate::modbus::{self, ModbusRTUCodec, Operation, Reply, Request, Response, ResponseKind};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt as _;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open serial port `{1}`")]
    OpenDevice(#[source] tokio_serial::Error, String),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the serial line")]
    Receive(#[source] std::io::Error),
    #[error("the serial line was closed")]
    Closed,
    #[error("no response from device {device_id} for register {address} within {timeout}")]
    Timeout { device_id: u8, address: u16, timeout: humantime::Duration },
    #[error(
        "device {device_id} rejected function {function_code:#04x} with exception {code:#04x} ({})",
        modbus::exception_description(*code)
    )]
    Exception { device_id: u8, function_code: u8, code: u8 },
    #[error("register count {count} is outside of the supported 1..={max}")]
    InvalidCount { count: usize, max: u16 },
    #[error("device {device_id} sent an unexpected response {kind:?}")]
    UnexpectedResponse { device_id: u8, kind: ResponseKind },
}

/// Coarse classification of errors, for surfaces that only show a short status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    ConnectionError,
    DeviceError,
    ValidationError,
    TransportTimeout,
    OutOfRange,
    Overflow,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OpenDevice(..)
            | Error::ScheduleRequest(_)
            | Error::Send(_)
            | Error::Receive(_)
            | Error::Closed => ErrorKind::ConnectionError,
            Error::Exception { .. } | Error::UnexpectedResponse { .. } => ErrorKind::DeviceError,
            Error::InvalidCount { .. } => ErrorKind::ValidationError,
            Error::Timeout { .. } => ErrorKind::TransportTimeout,
        }
    }

    /// Failures after which the serial stream can no longer be trusted.
    fn needs_reconnect(&self) -> bool {
        matches!(self, Error::Send(_) | Error::Receive(_) | Error::Closed)
    }
}

#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Result<Response, Error>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn add_outcome(&self, transaction_id: u16, outcome: Result<Response, Error>) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, outcome);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub async fn wait_for(&self, transaction_id: u16) -> Result<Response, Error> {
        loop {
            let mut notified = pin::pin!(self.change_notify.notified());
            // Register interest before looking, otherwise an outcome added in between is missed.
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&transaction_id) {
                    return v;
                }
            }
            notified.await;
        }
    }
}

fn parse_baudrate(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(b @ (9600 | 19200 | 38400 | 115200)) => Ok(b),
        _ => Err(format!("`{value}` is not one of 9600, 19200, 38400 or 115200")),
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// The serial port the RS-485 adapter is attached to (e.g. `/dev/ttyUSB0` or `COM3`).
    #[arg(long, short = 'p')]
    port: String,

    /// Serial line speed. The boards always use 8 data bits, no parity and 1 stop bit.
    #[arg(long, short = 'b', default_value = "115200", value_parser = parse_baudrate)]
    baudrate: u32,

    /// The modbus slave ID of the board.
    #[arg(long, short = 'i', default_value = "100")]
    slave_id: u8,

    /// If the modbus response isn't received in this amount of time plus the time it takes to
    /// transmit the response at the configured baud rate, consider the request failed.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// Reopen the serial port after this many consecutive requests time out.
    #[arg(long, default_value = "3")]
    reconnect_after_timeouts: usize,
}

impl Args {
    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }
}

/// Produces fresh byte streams to the device, both initially and after a connection failure.
pub trait Opener: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    fn open(&mut self) -> impl Future<Output = Result<Self::Io, Error>> + Send;
}

pub struct SerialOpener {
    port: String,
    baudrate: u32,
}

impl Opener for SerialOpener {
    type Io = tokio_serial::SerialStream;
    async fn open(&mut self) -> Result<Self::Io, Error> {
        info!(message = "opening serial port", port = %self.port, baudrate = self.baudrate);
        let stream = tokio_serial::new(&self.port, self.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| Error::OpenDevice(e, self.port.clone()))?;
        info!(message = "serial port open", port = %self.port);
        Ok(stream)
    }
}

/// A long-lived connection to the modbus bus.
///
/// The serial stream is owned by a worker task. Requests are queued and sent out one at a time;
/// the worker reopens the port explicitly after an I/O failure or after too many consecutive
/// timeouts. Nothing is retried automatically.
pub struct Connection {
    pub request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    pub response_tracker: Arc<ResponseTracker>,
    #[allow(unused)] // exists for its drop handler
    worker: AbortOnDropHandle<()>,
    transaction_id_generator: AtomicU16,
}

impl Connection {
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let opener = SerialOpener { port: args.port.clone(), baudrate: args.baudrate };
        Self::with_opener(args, opener).await
    }

    /// Open the first stream right away so that a misconfigured port is reported up front.
    pub async fn with_opener<O: Opener>(args: Args, mut opener: O) -> Result<Connection, Error> {
        let io = Framed::new(opener.open().await?, ModbusRTUCodec {});
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker: Arc<ResponseTracker> = Default::default();
        let worker = RtuWorker {
            reconnect_countdown: args.reconnect_after_timeouts,
            args,
            opener,
            responses: Arc::clone(&response_tracker),
        }
        .spawn(io, jobs);
        Ok(Self {
            request_queue,
            response_tracker,
            worker,
            transaction_id_generator: AtomicU16::new(0),
        })
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Send out a single request and wait for its outcome.
    ///
    /// Modbus exception replies are returned as [`Error::Exception`].
    pub async fn send(&self, device_id: u8, operation: Operation) -> Result<Response, Error> {
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { device_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        let response = self.response_tracker.wait_for(transaction_id).await?;
        if let ResponseKind::ErrorCode { function_code, code } = response.kind {
            return Err(Error::Exception { device_id, function_code, code });
        }
        Ok(response)
    }

    pub async fn read_holdings(
        &self,
        address: u16,
        slave_id: u8,
        count: u16,
    ) -> Result<Vec<u16>, Error> {
        if !(1..=modbus::MAX_READ_COUNT).contains(&count) {
            return Err(Error::InvalidCount { count: count.into(), max: modbus::MAX_READ_COUNT });
        }
        let response = self.send(slave_id, Operation::GetHoldings { address, count }).await?;
        match response.kind {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => {
                Ok(values)
            }
            kind => Err(Error::UnexpectedResponse { device_id: slave_id, kind }),
        }
    }

    pub async fn write_single(&self, address: u16, slave_id: u8, value: u16) -> Result<(), Error> {
        let response = self.send(slave_id, Operation::SetHolding { address, value }).await?;
        match response.kind {
            ResponseKind::SetHolding { address: a, value: v } if a == address && v == value => {
                Ok(())
            }
            kind => Err(Error::UnexpectedResponse { device_id: slave_id, kind }),
        }
    }

    pub async fn write_multiple(
        &self,
        address: u16,
        slave_id: u8,
        values: &[u16],
    ) -> Result<(), Error> {
        let count = u16::try_from(values.len())
            .ok()
            .filter(|c| (1..=modbus::MAX_WRITE_COUNT).contains(c))
            .ok_or(Error::InvalidCount { count: values.len(), max: modbus::MAX_WRITE_COUNT })?;
        let operation = Operation::SetHoldings { address, values: values.to_vec() };
        let response = self.send(slave_id, operation).await?;
        match response.kind {
            ResponseKind::SetHoldings { address: a, count: c } if a == address && c == count => {
                Ok(())
            }
            kind => Err(Error::UnexpectedResponse { device_id: slave_id, kind }),
        }
    }
}

type RtuIo<S> = Framed<S, ModbusRTUCodec>;

struct RtuWorker<O> {
    args: Args,
    opener: O,
    responses: Arc<ResponseTracker>,
    reconnect_countdown: usize,
}

impl<O: Opener> RtuWorker<O> {
    fn spawn(
        self,
        io: RtuIo<O::Io>,
        jobs: UnboundedReceiver<modbus::Request>,
    ) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(tokio::task::spawn(self.main_loop(io, jobs)))
    }

    async fn main_loop(mut self, io: RtuIo<O::Io>, mut jobs: UnboundedReceiver<modbus::Request>) {
        let mut io = Some(io);
        while let Some(request) = jobs.recv().await {
            let mut stream = match io.take() {
                Some(stream) => stream,
                None => match self.reconnect().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(
                            message = "reopening the serial port failed",
                            error = (&e as &dyn std::error::Error)
                        );
                        self.responses.add_outcome(request.transaction_id, Err(e));
                        continue;
                    }
                },
            };
            let outcome = self.exchange(&mut stream, &request).await;
            let keep_stream = match &outcome {
                Ok(_) => {
                    self.reconnect_countdown = self.args.reconnect_after_timeouts;
                    true
                }
                Err(e) if e.needs_reconnect() => {
                    warn!(
                        message = "serial line failed, will reconnect",
                        error = (e as &dyn std::error::Error)
                    );
                    false
                }
                Err(Error::Timeout { .. }) => {
                    self.reconnect_countdown = self.reconnect_countdown.saturating_sub(1);
                    debug!(
                        message = "request timed out",
                        transaction_id = request.transaction_id,
                        reconnect_countdown = self.reconnect_countdown
                    );
                    if self.reconnect_countdown == 0 {
                        warn!("too many consecutive timeouts, will reconnect");
                    }
                    self.reconnect_countdown != 0
                }
                Err(_) => true,
            };
            let timed_out = matches!(outcome, Err(Error::Timeout { .. }));
            self.responses.add_outcome(request.transaction_id, outcome);
            if !keep_stream {
                continue;
            }
            // Whatever still arrives belongs to the request that just timed out.
            if timed_out {
                if let Err(e) = self.drain(&mut stream).await {
                    warn!(
                        message = "serial line failed while draining, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                    continue;
                }
            }
            io = Some(stream);
        }
        debug!("request queue closed, connection worker exiting");
    }

    async fn reconnect(&mut self) -> Result<RtuIo<O::Io>, Error> {
        let stream = self.opener.open().await?;
        self.reconnect_countdown = self.args.reconnect_after_timeouts;
        Ok(Framed::new(stream, ModbusRTUCodec {}))
    }

    /// Discard incoming data until the line stays quiet for the read timeout.
    ///
    /// A device that keeps talking is cut off after three read timeouts.
    async fn drain(&self, io: &mut RtuIo<O::Io>) -> Result<(), Error> {
        let quiet = *self.args.read_timeout;
        let give_up = Instant::now() + 3 * quiet;
        loop {
            let until = (Instant::now() + quiet).min(give_up);
            match tokio::time::timeout_at(until, io.next()).await {
                Err(_) => break,
                Ok(None) => return Err(Error::Closed),
                Ok(Some(Err(e))) => return Err(Error::Receive(e)),
                Ok(Some(Ok(reply))) => debug!(message = "discarding a late reply", ?reply),
            }
        }
        io.read_buffer_mut().clear();
        Ok(())
    }

    async fn exchange(&self, io: &mut RtuIo<O::Io>, request: &Request) -> Result<Response, Error> {
        io.send(request).await.map_err(Error::Send)?;
        // 8N1 framing puts 10 bits on the wire per byte.
        let response_length = u64::from(request.expected_response_length());
        let transmission = Duration::from_secs(response_length) / (self.args.baudrate / 10);
        let timeout = *self.args.read_timeout + transmission;
        let deadline = Instant::now() + timeout;
        loop {
            let reply = match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => {
                    return Err(Error::Timeout {
                        device_id: request.device_id,
                        address: request.operation.address(),
                        timeout: timeout.into(),
                    });
                }
                Ok(None) => return Err(Error::Closed),
                Ok(Some(Err(e))) => return Err(Error::Receive(e)),
                Ok(Some(Ok(reply))) => reply,
            };
            let Reply { device_id, kind } = reply;
            if device_id != request.device_id
                || kind.function_code() != request.operation.function_code()
            {
                debug!(message = "a reply we were not expecting", device_id, ?kind);
                continue;
            }
            trace!(message = "decoded a reply", transaction = request.transaction_id, ?kind);
            return Ok(Response { device_id, transaction_id: request.transaction_id, kind });
        }
    }
}
