use crate::modbus::{self, FrameCodec, Framer, Operation, Request, Response, ResponseKind};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the modbus server closed the connection")]
    Closed,
    #[error("no response received after {0} attempts")]
    Timeout(usize),
    #[error("modbus server reported exception {0}")]
    Exception(u8),
    #[error("modbus server responded to a different operation")]
    UnexpectedResponse,
    #[error("requested {requested} registers, received {received} bytes")]
    ShortResponse { requested: u16, received: usize },
}

impl Error {
    /// Whether the connection can no longer be used after this error.
    fn breaks_connection(&self) -> bool {
        matches!(self, Error::Send(_) | Error::Receive(_) | Error::Closed)
    }
}

/// The device side of the bridge: something that holding registers can be read from and written to.
#[allow(async_fn_in_trait)]
pub trait FieldBus {
    async fn connect(&mut self) -> Result<(), Error>;
    async fn disconnect(&mut self);
    /// Read `count` consecutive holding registers starting at `start`.
    async fn read_span(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Error>;
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), Error>;
    /// Failed reads since the last successful connect.
    fn error_count(&self) -> usize;
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Address of the inverter's Modbus endpoint, e.g. `espressif:5743`.
    #[arg(long, env = "MTEC_MQTT_MODBUS")]
    modbus: String,

    /// Framing spoken by the Modbus endpoint.
    #[arg(long, env = "MTEC_MQTT_FRAMER", default_value = "rtu")]
    framer: Framer,

    /// The modbus device ID of the inverter.
    #[arg(long, env = "MTEC_MQTT_SLAVE", default_value = "252")]
    slave: u8,

    /// If the modbus response isn't received in this amount of time, consider the attempt failed.
    #[arg(long, env = "MTEC_MQTT_READ_TIMEOUT", default_value = "5s")]
    read_timeout: humantime::Duration,

    /// Attempts to repeat a request that timed out before giving up on it.
    #[arg(long, env = "MTEC_MQTT_RETRIES", default_value = "3")]
    retries: usize,
}

type Io = Framed<TcpStream, FrameCodec>;

pub struct ModbusClient {
    args: Args,
    io: Option<Io>,
    next_transaction: u16,
    errors: usize,
}

impl ModbusClient {
    pub fn new(args: Args) -> Self {
        Self {
            args,
            io: None,
            next_transaction: 0,
            errors: 0,
        }
    }

    fn new_request(&mut self, operation: Operation) -> Request {
        let transaction_id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        Request {
            device_id: self.args.slave,
            transaction_id,
            operation,
        }
    }

    /// Send `operation` and wait for its response, retrying timed out attempts.
    async fn send_retrying(&mut self, operation: Operation) -> Result<Response, Error> {
        if self.io.is_none() {
            self.connect().await?;
        }
        let attempts = self.args.retries + 1;
        for attempt in 1..=attempts {
            let request = self.new_request(operation);
            match self.send(request).await {
                Ok(response) => return Ok(response),
                Err(None) => {
                    debug!(
                        message = "request timed out",
                        transaction = request.transaction_id,
                        attempt
                    );
                }
                Err(Some(e)) => {
                    if e.breaks_connection() {
                        warn!(message = "connection lost", err = ?e);
                        self.io = None;
                    }
                    return Err(e);
                }
            }
        }
        Err(Error::Timeout(attempts))
    }

    /// `Err(None)` means the read timeout has elapsed.
    async fn send(&mut self, request: Request) -> Result<Response, Option<Error>> {
        let io = self.io.as_mut().ok_or(Some(Error::Closed))?;
        io.send(request).await.map_err(|e| Some(Error::Send(e)))?;
        let deadline = Instant::now() + *self.args.read_timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, io.next())
                .await
                .map_err(|_| None)?;
            let response = match next {
                None => return Err(Some(Error::Closed)),
                Some(response) => response.map_err(|e| Some(Error::Receive(e)))?,
            };
            trace!(message = "decoded a response", transaction = response.transaction_id);
            if response.transaction_id != request.transaction_id
                || response.device_id != request.device_id
            {
                debug!(
                    message = "a response we were not expecting",
                    transaction = response.transaction_id,
                    device = response.device_id
                );
                continue;
            }
            return Ok(response);
        }
    }

    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        let response = self
            .send_retrying(Operation::GetHoldings { address, count })
            .await?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Err(Error::Exception(code)),
            ResponseKind::SetHolding { .. } => Err(Error::UnexpectedResponse),
            ResponseKind::GetHoldings { values } => {
                if values.len() != 2 * usize::from(count) {
                    return Err(Error::ShortResponse {
                        requested: count,
                        received: values.len(),
                    });
                }
                Ok(modbus::words(&values))
            }
        }
    }
}

impl FieldBus for ModbusClient {
    async fn connect(&mut self) -> Result<(), Error> {
        let address = &self.args.modbus;
        info!(message = "connecting...", address, framer = %self.args.framer);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        self.io = Some(Framed::new(socket, FrameCodec::from(self.args.framer)));
        self.errors = 0;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.close().await {
                debug!(message = "could not shut down the connection cleanly", err = ?e);
            }
            info!(message = "disconnected");
        }
    }

    async fn read_span(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Error> {
        let result = self.read(start, count).await;
        if let Err(e) = &result {
            self.errors += 1;
            warn!(
                message = "reading registers failed",
                register.address = start,
                count,
                errors = self.errors,
                err = %e
            );
        }
        result
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), Error> {
        let response = self
            .send_retrying(Operation::SetHolding { address, value })
            .await?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Err(Error::Exception(code)),
            ResponseKind::SetHolding {
                address: a,
                value: v,
            } if a == address && v == value => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    fn error_count(&self) -> usize {
        self.errors
    }
}
