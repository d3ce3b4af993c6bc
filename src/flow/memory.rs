//! In-process flow pairs.
//!
//! Each direction of a pair is a bounded byte queue. Writes are accepted whole while the queue is
//! below its capacity, the same soft limit [`TcpFlow`](super::tcp::TcpFlow) applies to its send
//! buffer.

use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use mio::{Registry, Token};
use parking_lot::Mutex;

use super::{Flow, FlowConfig, FlowProperties, LoopWaker, Readiness};
use crate::error::{FlowError, FlowResult};

#[derive(Debug)]
struct Pipe {
    buf: BytesMut,
    capacity: usize,
    /// writer shut down its sending side
    finished: bool,
    reader_gone: bool,
    writer_gone: bool,
    reader_waker: Option<LoopWaker>,
    writer_waker: Option<LoopWaker>,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            finished: false,
            reader_gone: false,
            writer_gone: false,
            reader_waker: None,
            writer_waker: None,
        }))
    }

    fn wake_reader(&self) {
        if let Some(waker) = &self.reader_waker {
            let _ = waker.wake();
        }
    }

    fn wake_writer(&self) {
        if let Some(waker) = &self.writer_waker {
            let _ = waker.wake();
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    next_read: Option<FlowError>,
    next_write: Option<FlowError>,
    raised: Option<FlowError>,
    waker: Option<LoopWaker>,
}

/// Injects transport failures into a [`MemoryFlow`] from outside its context.
#[derive(Debug, Clone)]
pub struct MemoryFaults {
    faults: Arc<Mutex<Faults>>,
}

impl MemoryFaults {
    /// The next read returns `err` instead of data.
    pub fn fail_next_read(&self, err: FlowError) {
        self.faults.lock().next_read = Some(err);
    }

    /// The next write returns `err` and accepts nothing.
    pub fn fail_next_write(&self, err: FlowError) {
        self.faults.lock().next_write = Some(err);
    }

    /// Fail the flow asynchronously, the context reports `err` through `on_error`.
    pub fn raise(&self, err: FlowError) {
        let mut faults = self.faults.lock();
        faults.raised = Some(err);
        if let Some(waker) = &faults.waker {
            let _ = waker.wake();
        }
    }
}

/// One end of an in-process flow pair
#[derive(Debug)]
pub struct MemoryFlow {
    rx: Arc<Mutex<Pipe>>,
    tx: Arc<Mutex<Pipe>>,
    properties: FlowProperties,
    unacked: bool,
    failed: bool,
    closed: bool,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryFlow {
    /// Create a connected pair, each direction buffers up to the configured send buffer size.
    pub fn pair(config: &FlowConfig) -> (MemoryFlow, MemoryFlow) {
        let a_to_b = Pipe::new(config.get_send_buffer_size());
        let b_to_a = Pipe::new(config.get_send_buffer_size());

        let a = MemoryFlow::new(b_to_a.clone(), a_to_b.clone(), config.get_properties());
        let b = MemoryFlow::new(a_to_b, b_to_a, config.get_properties());

        (a, b)
    }

    fn new(rx: Arc<Mutex<Pipe>>, tx: Arc<Mutex<Pipe>>, properties: FlowProperties) -> Self {
        Self {
            rx,
            tx,
            properties,
            unacked: false,
            failed: false,
            closed: false,
            faults: Default::default(),
        }
    }

    pub fn faults(&self) -> MemoryFaults {
        MemoryFaults {
            faults: self.faults.clone(),
        }
    }

    /// Bytes written by this end the peer hasn't read yet
    pub fn pending_output(&self) -> usize {
        self.tx.lock().buf.len()
    }

    fn check_usable(&self) -> FlowResult<()> {
        if self.closed {
            return Err(FlowError::BadArgument);
        }
        if self.failed {
            return Err(FlowError::Io(io::Error::from(ErrorKind::ConnectionAborted)));
        }

        Ok(())
    }
}

impl Flow for MemoryFlow {
    fn register(
        &mut self,
        _registry: &Registry,
        _token: Token,
        waker: &LoopWaker,
    ) -> FlowResult<()> {
        self.rx.lock().reader_waker = Some(waker.clone());
        self.tx.lock().writer_waker = Some(waker.clone());
        self.faults.lock().waker = Some(waker.clone());

        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> FlowResult<()> {
        self.rx.lock().reader_waker = None;
        self.tx.lock().writer_waker = None;
        self.faults.lock().waker = None;

        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn readiness(&self) -> Readiness {
        if self.failed || self.faults.lock().raised.is_some() {
            return Readiness::ERROR;
        }

        let mut readiness = Readiness::EMPTY;

        let rx = self.rx.lock();
        if !rx.buf.is_empty() || rx.finished || rx.writer_gone {
            readiness |= Readiness::READABLE;
        }
        drop(rx);

        let tx = self.tx.lock();
        if !tx.finished && !tx.reader_gone && tx.buf.len() < tx.capacity {
            readiness |= Readiness::WRITABLE;
        }

        readiness
    }

    fn take_error(&mut self) -> Option<FlowError> {
        let err = self.faults.lock().raised.take()?;
        self.failed = true;

        Some(err)
    }

    fn take_all_written(&mut self) -> bool {
        std::mem::take(&mut self.unacked)
    }

    fn read(&mut self, buf: &mut [u8]) -> FlowResult<usize> {
        self.check_usable()?;
        if let Some(err) = self.faults.lock().next_read.take() {
            return Err(err);
        }

        let mut rx = self.rx.lock();
        if rx.buf.is_empty() {
            if rx.finished || rx.writer_gone {
                return Ok(0);
            }

            return Err(FlowError::WouldBlock);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let n = buf.len().min(rx.buf.len());
        buf[..n].copy_from_slice(&rx.buf[..n]);
        rx.buf.advance(n);
        rx.wake_writer();

        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> FlowResult<()> {
        self.check_usable()?;
        if let Some(err) = self.faults.lock().next_write.take() {
            return Err(err);
        }

        let mut tx = self.tx.lock();
        if tx.finished {
            return Err(FlowError::Io(io::Error::new(
                ErrorKind::BrokenPipe,
                "flow send side is shut down",
            )));
        }
        if tx.reader_gone {
            return Err(FlowError::Io(io::Error::from(ErrorKind::BrokenPipe)));
        }
        if tx.buf.len() >= tx.capacity {
            return Err(FlowError::WouldBlock);
        }

        tx.buf.extend_from_slice(buf);
        tx.wake_reader();
        self.unacked = true;

        Ok(())
    }

    fn shutdown(&mut self) -> FlowResult<()> {
        self.check_usable()?;

        let mut tx = self.tx.lock();
        tx.finished = true;
        tx.wake_reader();

        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut rx = self.rx.lock();
        rx.reader_gone = true;
        rx.reader_waker = None;
        rx.wake_writer();
        drop(rx);

        let mut tx = self.tx.lock();
        tx.writer_gone = true;
        tx.writer_waker = None;
        tx.wake_reader();
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn properties(&self) -> FlowProperties {
        self.properties
    }

    fn set_properties(&mut self, properties: FlowProperties) -> FlowResult<()> {
        self.properties = properties;

        Ok(())
    }
}

impl Drop for MemoryFlow {
    fn drop(&mut self) {
        self.close();
    }
}
