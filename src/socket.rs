//! Blocking socket calls over flows.
//!
//! A [`SocketApi`] maps descriptors either to a flow owned by a [`FlowContext`] or to an OS socket
//! it passes calls through to. Flow calls make one non-blocking attempt, and when that would block
//! on a blocking descriptor they wait for the context to report readiness and retry exactly once.
//!
//! [`FlowContext`]: crate::context::FlowContext

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use parking_lot::Mutex;
use rustix::event::{PollFd, PollFlags};
use rustix::net::sockopt::{self, Timeout};
use rustix::net::{RecvAncillaryBuffer, SendAncillaryBuffer, SocketAddrAny};
pub use rustix::net::{RecvFlags, SendFlags};
use tracing::{debug, instrument};

use crate::context::{ContextHandle, FlowCtl, FlowHandle, FlowHandler};
use crate::error::{translate, Direction, FlowError, FlowResult, SocketError};
use crate::flow::{Flow, Readiness};
use crate::waiter::{ReadinessWaiter, WaitOutcome};

const SCATTER_GATHER_UNSUPPORTED: &str = "scatter/gather I/O is not implemented";

/// A socket identifier handed out by [`SocketApi`], never reused by the same registry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Descriptor(i32);

impl Descriptor {
    pub fn raw(self) -> i32 {
        self.0
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct FlowBackend {
    handle: FlowHandle,
    #[derivative(Debug = "ignore")]
    waiter: Arc<ReadinessWaiter>,
}

#[derive(Debug)]
enum Backend {
    Flow(FlowBackend),
    Passthrough(OwnedFd),
}

#[derive(Debug, Default)]
struct SocketState {
    nonblocking: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    readiness: Readiness,
    eof: bool,
    closed: bool,
}

impl SocketState {
    fn check_open(&self) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::BadDescriptor);
        }

        Ok(())
    }

    fn timeout(&self, direction: Direction) -> Option<Duration> {
        match direction {
            Direction::Transmit => self.write_timeout,
            Direction::Receive => self.read_timeout,
        }
    }
}

#[derive(Debug)]
struct Socket {
    backend: Backend,
    state: Mutex<SocketState>,
    /// one blocked caller at a time, whichever direction
    wait_gate: Mutex<()>,
}

impl Socket {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Default::default(),
            wait_gate: Mutex::new(()),
        }
    }
}

/// Forwards readiness of a bridged flow to its [`ReadinessWaiter`].
struct BridgeHandler {
    waiter: Arc<ReadinessWaiter>,
}

impl FlowHandler for BridgeHandler {
    fn on_readable(&mut self, ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        self.waiter.signal(Readiness::READABLE);
        ctl.disable(Readiness::READABLE);

        Ok(())
    }

    fn on_writable(&mut self, ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        self.waiter.signal(Readiness::WRITABLE);
        ctl.disable(Readiness::WRITABLE);

        Ok(())
    }

    fn on_error(&mut self, ctl: &mut FlowCtl<'_>, err: FlowError) -> anyhow::Result<()> {
        debug!(id = ?ctl.id(), %err, "bridged flow failed");

        self.waiter.interrupt();
        ctl.set_interest(Readiness::EMPTY);

        Ok(())
    }
}

impl Drop for BridgeHandler {
    fn drop(&mut self) {
        // the flow left the context, nothing will signal this waiter again
        self.waiter.interrupt();
    }
}

/// Descriptor registry and the socket call surface.
#[derive(Debug)]
pub struct SocketApi {
    context: ContextHandle,
    sockets: Mutex<HashMap<Descriptor, Arc<Socket>>>,
    next_fd: AtomicI32,
}

impl SocketApi {
    pub fn new(context: ContextHandle) -> Self {
        Self {
            context,
            sockets: Default::default(),
            next_fd: AtomicI32::new(1),
        }
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// Hand `flow` to the context and return a descriptor bridged onto it.
    #[instrument(level = "debug", skip(self, flow), err(Debug))]
    pub fn open_flow(&self, flow: Box<dyn Flow>) -> Result<Descriptor, SocketError> {
        let waiter = Arc::new(ReadinessWaiter::new());
        let handle = self
            .context
            .register(
                flow,
                Box::new(BridgeHandler {
                    waiter: waiter.clone(),
                }),
                Readiness::EMPTY,
            )
            .map_err(|_| SocketError::Io)?;

        Ok(self.attach_flow(handle, waiter))
    }

    /// Bridge a flow that is already registered with the context.
    ///
    /// The flow's handler must [`signal`](ReadinessWaiter::signal) `waiter` for readiness this
    /// registry adds to the flow's interest, and interrupt it when the flow fails or closes.
    pub fn attach_flow(&self, handle: FlowHandle, waiter: Arc<ReadinessWaiter>) -> Descriptor {
        self.insert(Backend::Flow(FlowBackend { handle, waiter }))
    }

    /// Wrap an OS socket, every call on the descriptor is forwarded unmodified.
    pub fn open_passthrough(&self, fd: OwnedFd) -> Descriptor {
        self.insert(Backend::Passthrough(fd))
    }

    fn insert(&self, backend: Backend) -> Descriptor {
        let fd = Descriptor(self.next_fd.fetch_add(1, Ordering::Relaxed));
        self.sockets.lock().insert(fd, Arc::new(Socket::new(backend)));

        debug!(?fd, "socket opened");

        fd
    }

    fn socket(&self, fd: Descriptor) -> Result<Arc<Socket>, SocketError> {
        self.sockets
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(SocketError::BadDescriptor)
    }

    /// Remove the descriptor, blocked callers on it fail with [`SocketError::BadDescriptor`].
    #[instrument(level = "debug", skip(self), err(Debug))]
    pub fn close(&self, fd: Descriptor) -> Result<(), SocketError> {
        let socket = self
            .sockets
            .lock()
            .remove(&fd)
            .ok_or(SocketError::BadDescriptor)?;

        self.release(&socket);

        Ok(())
    }

    fn release(&self, socket: &Socket) {
        socket.state.lock().closed = true;

        if let Backend::Flow(flow) = &socket.backend {
            flow.waiter.interrupt();

            if let Err(err) = self.context.close(flow.handle.id()) {
                debug!(id = ?flow.handle.id(), %err, "close bridged flow failed");
            }
        }
    }

    pub fn set_nonblocking(&self, fd: Descriptor, nonblocking: bool) -> Result<(), SocketError> {
        let socket = self.socket(fd)?;
        let mut state = socket.state.lock();
        state.check_open()?;

        if let Backend::Passthrough(os) = &socket.backend {
            rustix::io::ioctl_fionbio(os, nonblocking).map_err(SocketError::Os)?;
        }
        state.nonblocking = nonblocking;

        Ok(())
    }

    pub fn is_nonblocking(&self, fd: Descriptor) -> Result<bool, SocketError> {
        let socket = self.socket(fd)?;
        let state = socket.state.lock();
        state.check_open()?;

        Ok(state.nonblocking)
    }

    /// Bound blocking receives, `None` waits forever.
    pub fn set_read_timeout(
        &self,
        fd: Descriptor,
        timeout: Option<Duration>,
    ) -> Result<(), SocketError> {
        self.set_timeout(fd, Direction::Receive, timeout)
    }

    /// Bound blocking sends, `None` waits forever.
    pub fn set_write_timeout(
        &self,
        fd: Descriptor,
        timeout: Option<Duration>,
    ) -> Result<(), SocketError> {
        self.set_timeout(fd, Direction::Transmit, timeout)
    }

    fn set_timeout(
        &self,
        fd: Descriptor,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Result<(), SocketError> {
        let socket = self.socket(fd)?;
        let mut state = socket.state.lock();
        state.check_open()?;

        if let Backend::Passthrough(os) = &socket.backend {
            let id = match direction {
                Direction::Transmit => Timeout::Send,
                Direction::Receive => Timeout::Recv,
            };
            sockopt::set_socket_timeout(os, id, timeout).map_err(SocketError::Os)?;
        }

        match direction {
            Direction::Transmit => state.write_timeout = timeout,
            Direction::Receive => state.read_timeout = timeout,
        }

        Ok(())
    }

    /// Readiness seen by the last transfer on a flow descriptor.
    pub fn last_readiness(&self, fd: Descriptor) -> Result<Readiness, SocketError> {
        let socket = self.socket(fd)?;
        let state = socket.state.lock();
        state.check_open()?;

        Ok(state.readiness)
    }

    /// Wait until the descriptor has readiness in `interest`, [`Readiness::ERROR`] is always
    /// reported.
    ///
    /// Returns [`Readiness::EMPTY`] when `timeout` passes first, a zero timeout never blocks.
    #[instrument(level = "debug", skip(self), err(Debug))]
    pub fn poll(
        &self,
        fd: Descriptor,
        interest: Readiness,
        timeout: Option<Duration>,
    ) -> Result<Readiness, SocketError> {
        let socket = self.socket(fd)?;
        socket.state.lock().check_open()?;

        let interest = (interest | Readiness::ERROR).without(Readiness::ALL_WRITTEN);

        let flow = match &socket.backend {
            Backend::Passthrough(os) => return poll_os(os, interest, timeout),
            Backend::Flow(flow) => flow,
        };

        let current = flow
            .handle
            .with_flow(|flow| flow.readiness())
            .ok_or(SocketError::BadDescriptor)?;
        if current.intersects(interest) || timeout == Some(Duration::ZERO) {
            return Ok(current & interest);
        }

        match self.wait_ready(flow, interest, timeout) {
            Err(SocketError::TimedOut) => return Ok(Readiness::EMPTY),
            Err(err) => return Err(err),
            Ok(_) => {}
        }

        socket.state.lock().check_open()?;
        let current = flow
            .handle
            .with_flow(|flow| flow.readiness())
            .ok_or(SocketError::BadDescriptor)?;

        Ok(current & interest)
    }

    pub fn send(&self, fd: Descriptor, buf: &[u8], flags: SendFlags) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => rustix::net::send(os, buf, flags).map_err(SocketError::Os),
            Backend::Flow(flow) => self.flow_send(fd, &socket, flow, buf, flags),
        }
    }

    /// Like [`send`](Self::send), a flow is already connected so `addr` only matters for
    /// passthrough descriptors.
    pub fn sendto(
        &self,
        fd: Descriptor,
        buf: &[u8],
        flags: SendFlags,
        addr: &SocketAddr,
    ) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => {
                rustix::net::sendto(os, buf, flags, addr).map_err(SocketError::Os)
            }
            Backend::Flow(flow) => self.flow_send(fd, &socket, flow, buf, flags),
        }
    }

    pub fn write(&self, fd: Descriptor, buf: &[u8]) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => rustix::io::write(os, buf).map_err(SocketError::Os),
            Backend::Flow(flow) => self.flow_send(fd, &socket, flow, buf, SendFlags::empty()),
        }
    }

    /// Flow descriptors take exactly one segment and no ancillary data.
    ///
    /// # Panics
    ///
    /// Panics when a flow descriptor is given other than one segment.
    pub fn sendmsg(
        &self,
        fd: Descriptor,
        iov: &[IoSlice<'_>],
        flags: SendFlags,
    ) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => {
                rustix::net::sendmsg(os, iov, &mut SendAncillaryBuffer::default(), flags)
                    .map_err(SocketError::Os)
            }
            Backend::Flow(flow) => {
                let buf = single_segment(iov);
                self.flow_send(fd, &socket, flow, buf, flags)
            }
        }
    }

    /// # Panics
    ///
    /// Panics when a flow descriptor is given other than one segment.
    pub fn writev(&self, fd: Descriptor, iov: &[IoSlice<'_>]) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => rustix::io::writev(os, iov).map_err(SocketError::Os),
            Backend::Flow(flow) => {
                let buf = single_segment(iov);
                self.flow_send(fd, &socket, flow, buf, SendFlags::empty())
            }
        }
    }

    /// `Ok(0)` means the peer shut down its sending side, later calls keep returning it.
    pub fn recv(
        &self,
        fd: Descriptor,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => rustix::net::recv(os, buf, flags).map_err(SocketError::Os),
            Backend::Flow(flow) => self.flow_recv(fd, &socket, flow, buf, flags),
        }
    }

    /// Like [`recv`](Self::recv), also returns the sender address when it is known.
    pub fn recvfrom(
        &self,
        fd: Descriptor,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> Result<(usize, Option<SocketAddr>), SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => {
                let (n, addr) = rustix::net::recvfrom(os, buf, flags).map_err(SocketError::Os)?;

                Ok((n, addr.and_then(inet_addr)))
            }

            Backend::Flow(flow) => {
                let n = self.flow_recv(fd, &socket, flow, buf, flags)?;
                let peer = flow.handle.with_flow(|flow| flow.peer_addr()).flatten();

                Ok((n, peer))
            }
        }
    }

    pub fn read(&self, fd: Descriptor, buf: &mut [u8]) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => rustix::io::read(os, buf).map_err(SocketError::Os),
            Backend::Flow(flow) => self.flow_recv(fd, &socket, flow, buf, RecvFlags::empty()),
        }
    }

    /// # Panics
    ///
    /// Panics when a flow descriptor is given other than one segment.
    pub fn recvmsg(
        &self,
        fd: Descriptor,
        iov: &mut [IoSliceMut<'_>],
        flags: RecvFlags,
    ) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => {
                rustix::net::recvmsg(os, iov, &mut RecvAncillaryBuffer::default(), flags)
                    .map(|ret| ret.bytes)
                    .map_err(SocketError::Os)
            }
            Backend::Flow(flow) => {
                let buf = single_segment_mut(iov);
                self.flow_recv(fd, &socket, flow, buf, flags)
            }
        }
    }

    /// # Panics
    ///
    /// Panics when a flow descriptor is given other than one segment.
    pub fn readv(&self, fd: Descriptor, iov: &mut [IoSliceMut<'_>]) -> Result<usize, SocketError> {
        let socket = self.socket(fd)?;
        match &socket.backend {
            Backend::Passthrough(os) => rustix::io::readv(os, iov).map_err(SocketError::Os),
            Backend::Flow(flow) => {
                let buf = single_segment_mut(iov);
                self.flow_recv(fd, &socket, flow, buf, RecvFlags::empty())
            }
        }
    }

    fn flow_send(
        &self,
        fd: Descriptor,
        socket: &Socket,
        flow: &FlowBackend,
        buf: &[u8],
        flags: SendFlags,
    ) -> Result<usize, SocketError> {
        self.transfer(
            fd,
            socket,
            flow,
            Direction::Transmit,
            flags.contains(SendFlags::DONTWAIT),
            |flow| flow.write(buf).map(|()| buf.len()),
        )
    }

    fn flow_recv(
        &self,
        fd: Descriptor,
        socket: &Socket,
        flow: &FlowBackend,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> Result<usize, SocketError> {
        if buf.is_empty() {
            socket.state.lock().check_open()?;

            return Ok(0);
        }

        self.transfer(
            fd,
            socket,
            flow,
            Direction::Receive,
            flags.contains(RecvFlags::DONTWAIT),
            |flow| flow.read(buf),
        )
    }

    /// One attempt, and on a blocking descriptor one wait and one retry.
    #[instrument(level = "trace", skip(self, socket, flow, op), err(Debug))]
    fn transfer(
        &self,
        fd: Descriptor,
        socket: &Socket,
        flow: &FlowBackend,
        direction: Direction,
        dontwait: bool,
        mut op: impl FnMut(&mut dyn Flow) -> FlowResult<usize>,
    ) -> Result<usize, SocketError> {
        let interest = match direction {
            Direction::Transmit => Readiness::WRITABLE | Readiness::ERROR,
            Direction::Receive => Readiness::READABLE | Readiness::ERROR,
        };

        let timeout = {
            let mut state = socket.state.lock();
            state.check_open()?;
            if direction == Direction::Receive && state.eof {
                return Ok(0);
            }

            match attempt(&mut state, flow, direction, &mut op) {
                Err(SocketError::WouldBlock) if !state.nonblocking && !dontwait => {}
                res => return res,
            }

            state.timeout(direction)
        };

        let _gate = socket.wait_gate.lock();
        let ready = self.wait_ready(flow, interest, timeout)?;

        debug!(?fd, ?ready, "retry flow operation");

        let mut state = socket.state.lock();
        state.check_open()?;
        if direction == Direction::Receive && state.eof {
            return Ok(0);
        }

        attempt(&mut state, flow, direction, &mut op)
    }

    fn wait_ready(
        &self,
        flow: &FlowBackend,
        interest: Readiness,
        timeout: Option<Duration>,
    ) -> Result<Readiness, SocketError> {
        flow.waiter.arm(interest);

        let id = flow.handle.id();
        if let Err(err) = self.context.add_interest(id, interest.without(Readiness::ERROR)) {
            debug!(?id, %err, "watch bridged flow failed");

            flow.waiter.disarm(interest);

            return Err(SocketError::Io);
        }

        // leftover interest fires once into a disarmed waiter and is dropped there
        match flow.waiter.wait(interest, timeout) {
            WaitOutcome::Ready(ready) => Ok(ready),
            WaitOutcome::TimedOut => Err(SocketError::TimedOut),
        }
    }
}

impl Drop for SocketApi {
    fn drop(&mut self) {
        let sockets = std::mem::take(&mut *self.sockets.lock());
        for socket in sockets.values() {
            self.release(socket);
        }
    }
}

/// Run `op` against the flow under the descriptor lock, recording the readiness it leaves.
fn attempt(
    state: &mut SocketState,
    flow: &FlowBackend,
    direction: Direction,
    op: &mut impl FnMut(&mut dyn Flow) -> FlowResult<usize>,
) -> Result<usize, SocketError> {
    let (res, readiness) = flow
        .handle
        .with_flow(|flow| {
            let res = op(flow);
            (res, flow.readiness())
        })
        .ok_or(SocketError::BadDescriptor)?;

    state.readiness = readiness;

    match res {
        Ok(0) if direction == Direction::Receive => {
            state.eof = true;

            Ok(0)
        }

        Ok(n) => Ok(n),

        Err(err) => {
            let translated = translate(direction, &err);
            if !err.is_would_block() {
                debug!(?direction, %err, ?translated, "flow operation failed");
            }

            Err(translated)
        }
    }
}

fn single_segment<'a>(iov: &'a [IoSlice<'_>]) -> &'a [u8] {
    assert!(iov.len() == 1, "{}", SCATTER_GATHER_UNSUPPORTED);

    &iov[0]
}

fn single_segment_mut<'a>(iov: &'a mut [IoSliceMut<'_>]) -> &'a mut [u8] {
    assert!(iov.len() == 1, "{}", SCATTER_GATHER_UNSUPPORTED);

    &mut iov[0]
}

fn inet_addr(addr: SocketAddrAny) -> Option<SocketAddr> {
    match addr {
        SocketAddrAny::V4(addr) => Some(SocketAddr::V4(addr)),
        SocketAddrAny::V6(addr) => Some(SocketAddr::V6(addr)),
        _ => None,
    }
}

fn poll_os(
    fd: &OwnedFd,
    interest: Readiness,
    timeout: Option<Duration>,
) -> Result<Readiness, SocketError> {
    let mut flags = PollFlags::empty();
    if interest.contains(Readiness::READABLE) {
        flags |= PollFlags::IN;
    }
    if interest.contains(Readiness::WRITABLE) {
        flags |= PollFlags::OUT;
    }

    let timeout = match timeout {
        None => -1,
        Some(timeout) => timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32,
    };

    let mut fds = [PollFd::new(fd, flags)];
    rustix::event::poll(&mut fds, timeout).map_err(SocketError::Os)?;

    let revents = fds[0].revents();
    let mut ready = Readiness::EMPTY;
    if revents.intersects(PollFlags::IN | PollFlags::HUP) {
        ready |= Readiness::READABLE;
    }
    if revents.contains(PollFlags::OUT) {
        ready |= Readiness::WRITABLE;
    }
    if revents.contains(PollFlags::ERR) {
        ready |= Readiness::ERROR;
    }
    if revents.contains(PollFlags::NVAL) {
        return Err(SocketError::BadDescriptor);
    }

    Ok(ready & interest)
}
