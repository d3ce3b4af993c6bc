use std::io;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};

use bytes::{Buf, BytesMut};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, instrument, warn};

use super::{Flow, FlowConfig, FlowProperties, LoopWaker, Readiness};
use crate::error::{FlowError, FlowResult};

/// Properties a plain TCP connection can never satisfy
const UNSUPPORTED: FlowProperties = FlowProperties(
    FlowProperties::REQUIRED_SECURITY.bits()
        | FlowProperties::SCTP_REQUIRED.bits()
        | FlowProperties::UDP_REQUIRED.bits()
        | FlowProperties::UDPLITE_REQUIRED.bits()
        | FlowProperties::TCP_BANNED.bits(),
);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Connecting,
    Connected,
}

/// A flow over a non-blocking TCP connection.
///
/// Writes are buffered whole up to the configured send buffer size and flushed to the socket as
/// it becomes writable.
#[derive(Debug)]
pub struct TcpFlow {
    stream: TcpStream,
    peer: SocketAddr,
    state: State,
    properties: FlowProperties,

    send_limit: usize,
    pending: BytesMut,
    unflushed: bool,
    all_written: bool,
    shutdown_requested: bool,
    shut: bool,

    readable: bool,
    writable: bool,
    read_closed: bool,

    error: Option<FlowError>,
    failed: bool,
    closed: bool,
}

impl TcpFlow {
    /// Start connecting to `host:port`, the flow reports connected once the handshake is done.
    #[instrument(level = "debug", skip(config), err(Debug))]
    pub fn connect(host: &str, port: u16, config: &FlowConfig) -> FlowResult<Self> {
        let properties = config.get_properties();
        check_properties(properties)?;

        let peer = (host, port)
            .to_socket_addrs()?
            .find(|addr| family_allowed(properties, addr))
            .ok_or_else(|| {
                FlowError::Io(io::Error::new(
                    ErrorKind::NotFound,
                    format!("no address of {host} matches {properties:?}"),
                ))
            })?;

        let stream = TcpStream::connect(peer)?;

        debug!(%peer, "tcp flow connecting");

        Ok(Self {
            stream,
            peer,
            state: State::Connecting,
            properties,
            send_limit: config.get_send_buffer_size(),
            pending: BytesMut::with_capacity(config.get_send_buffer_size()),
            unflushed: false,
            all_written: false,
            shutdown_requested: false,
            shut: false,
            readable: false,
            writable: false,
            read_closed: false,
            error: None,
            failed: false,
            closed: false,
        })
    }

    fn fail(&mut self, err: FlowError) {
        if self.failed || self.error.is_some() {
            return;
        }

        warn!(peer = %self.peer, %err, "tcp flow failed");

        self.error = Some(err);
    }

    fn finish_connect(&mut self) {
        match self.stream.take_error() {
            Ok(Some(err)) | Err(err) => {
                self.fail(err.into());

                return;
            }

            Ok(None) => {}
        }

        match self.stream.peer_addr() {
            Ok(_) => {
                self.state = State::Connected;

                debug!(peer = %self.peer, "tcp flow connected");
            }

            // spurious wakeup, still connecting
            Err(err) if err.kind() == ErrorKind::NotConnected => {}

            Err(err) => self.fail(err.into()),
        }
    }

    fn check_usable(&self) -> FlowResult<()> {
        if self.closed {
            return Err(FlowError::BadArgument);
        }
        if self.failed {
            return Err(FlowError::Io(io::Error::new(
                ErrorKind::ConnectionAborted,
                "tcp flow failed",
            )));
        }

        Ok(())
    }

    fn flush(&mut self) -> FlowResult<()> {
        while !self.pending.is_empty() && self.writable {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(FlowError::Io(io::Error::from(ErrorKind::WriteZero))),
                Ok(n) => self.pending.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => self.writable = false,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        if !self.pending.is_empty() {
            return Ok(());
        }

        if self.unflushed {
            self.unflushed = false;
            self.all_written = true;
        }

        if self.shutdown_requested && !self.shut {
            self.stream.shutdown(Shutdown::Write)?;
            self.shut = true;

            debug!(peer = %self.peer, "tcp flow send side shut down");
        }

        Ok(())
    }

    fn flush_or_fail(&mut self) {
        if let Err(err) = self.flush() {
            self.fail(err);
        }
    }
}

impl Flow for TcpFlow {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        _waker: &LoopWaker,
    ) -> FlowResult<()> {
        registry.register(
            &mut self.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> FlowResult<()> {
        registry.deregister(&mut self.stream)?;

        Ok(())
    }

    fn handle_event(&mut self, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            self.readable = true;
        }
        if event.is_writable() || event.is_write_closed() {
            self.writable = true;
        }

        if self.state == State::Connecting {
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                self.finish_connect();
            }
        } else if event.is_error() {
            match self.stream.take_error() {
                Ok(Some(err)) | Err(err) => self.fail(err.into()),
                Ok(None) => {}
            }
        }
    }

    fn flush_pending(&mut self) -> FlowResult<()> {
        if self.failed || self.closed || self.state != State::Connected {
            return Ok(());
        }

        self.flush_or_fail();

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == State::Connected && !self.closed
    }

    fn readiness(&self) -> Readiness {
        if self.failed || self.error.is_some() {
            return Readiness::ERROR;
        }
        if !self.is_connected() {
            return Readiness::EMPTY;
        }

        let mut readiness = Readiness::EMPTY;
        if self.readable || self.read_closed {
            readiness |= Readiness::READABLE;
        }
        if !self.shutdown_requested && self.pending.len() < self.send_limit {
            readiness |= Readiness::WRITABLE;
        }

        readiness
    }

    fn take_error(&mut self) -> Option<FlowError> {
        let err = self.error.take()?;
        self.failed = true;

        Some(err)
    }

    fn take_all_written(&mut self) -> bool {
        std::mem::take(&mut self.all_written)
    }

    fn read(&mut self, buf: &mut [u8]) -> FlowResult<usize> {
        self.check_usable()?;
        if self.state != State::Connected {
            return Err(FlowError::WouldBlock);
        }
        if self.read_closed || buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    debug!(peer = %self.peer, "tcp flow peer shut down");

                    self.read_closed = true;

                    return Ok(0);
                }

                Ok(n) => return Ok(n),

                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.readable = false;

                    return Err(FlowError::WouldBlock);
                }

                Err(err) if err.kind() == ErrorKind::Interrupted => continue,

                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> FlowResult<()> {
        self.check_usable()?;
        if self.shutdown_requested {
            return Err(FlowError::Io(io::Error::new(
                ErrorKind::BrokenPipe,
                "tcp flow send side is shut down",
            )));
        }
        if self.state != State::Connected || self.pending.len() >= self.send_limit {
            return Err(FlowError::WouldBlock);
        }

        self.pending.extend_from_slice(buf);
        self.unflushed = true;

        // the data is accepted, a flush failure surfaces through take_error
        self.flush_or_fail();

        Ok(())
    }

    fn shutdown(&mut self) -> FlowResult<()> {
        self.check_usable()?;

        self.shutdown_requested = true;
        if self.state == State::Connected {
            self.flush_or_fail();
        }

        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            if err.kind() != ErrorKind::NotConnected {
                debug!(peer = %self.peer, %err, "shutdown tcp flow failed");
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn properties(&self) -> FlowProperties {
        self.properties
    }

    fn set_properties(&mut self, properties: FlowProperties) -> FlowResult<()> {
        check_properties(properties)?;
        if !family_allowed(properties, &self.peer) {
            return Err(FlowError::BadArgument);
        }

        self.properties = properties;

        Ok(())
    }
}

fn check_properties(properties: FlowProperties) -> FlowResult<()> {
    if properties.intersects(UNSUPPORTED) {
        return Err(FlowError::BadArgument);
    }

    Ok(())
}

fn family_allowed(properties: FlowProperties, addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(_) => {
            !properties.intersects(FlowProperties::IPV4_BANNED | FlowProperties::IPV6_REQUIRED)
        }
        SocketAddr::V6(_) => {
            !properties.intersects(FlowProperties::IPV6_BANNED | FlowProperties::IPV4_REQUIRED)
        }
    }
}
