//! Relay between a byte stream pair and a flow.
//!
//! Input is read one chunk at a time and written to the flow, the next chunk is only read after
//! the flow reports the previous one written. Everything the flow receives goes to the output.

use std::io::{Read, Write};

use anyhow::Context as _;
use bytes::BytesMut;
use tracing::{debug, info, instrument, trace, warn};

use crate::context::{FlowContext, FlowCtl, FlowHandler, Input};
use crate::error::FlowError;
use crate::flow::{Flow, Readiness};

mod input;
mod state;

pub use input::InputPump;
pub use state::{transition, Action, RelayEvent, RelayState, Step};

const DEFAULT_RECV_BUFFER_SIZE: usize = 256;
const DEFAULT_SEND_BUFFER_SIZE: usize = 128;

/// Relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    recv_buffer_size: usize,
    send_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
        }
    }
}

impl RelayConfig {
    /// Set the most bytes taken from the flow per read, default is 256
    pub fn recv_buffer_size(&mut self, size: usize) -> &mut Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Set the input chunk size, default is 128
    pub fn send_buffer_size(&mut self, size: usize) -> &mut Self {
        self.send_buffer_size = size.max(1);
        self
    }

    pub fn get_recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    pub fn get_send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }
}

/// Fixed capacity buffer holding one input chunk
#[derive(Debug)]
pub struct RelayBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl RelayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Replace the content with `data`, returns how many bytes fit.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity);
        self.buf.clear();
        self.buf.extend_from_slice(&data[..n]);

        n
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// The relay's [`FlowHandler`], drives [`transition`] from flow callbacks and input.
pub struct FlowRelay<W> {
    state: RelayState,
    chunk: RelayBuffer,
    recv_buf: Vec<u8>,
    input: InputPump,
    output: W,
}

impl<W: Write + Send> FlowRelay<W> {
    pub fn new(config: &RelayConfig, input: impl Read + Send + 'static, output: W) -> Self {
        Self {
            state: transition(RelayState::Idle, RelayEvent::Open).next,
            chunk: RelayBuffer::new(config.get_send_buffer_size()),
            recv_buf: vec![0; config.get_recv_buffer_size()],
            input: InputPump::new(input, config.get_send_buffer_size()),
            output,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn apply(&mut self, ctl: &mut FlowCtl<'_>, event: RelayEvent) -> anyhow::Result<()> {
        let step = transition(self.state, event);

        trace!(from = ?self.state, ?event, to = ?step.next, "relay transition");

        self.state = step.next;
        for action in step.actions {
            self.perform(ctl, *action)?;
        }

        Ok(())
    }

    fn perform(&mut self, ctl: &mut FlowCtl<'_>, action: Action) -> anyhow::Result<()> {
        match action {
            Action::StartInput => {
                self.input
                    .start(ctl.id(), ctl.handle())
                    .with_context(|| "start input reader failed")?;
            }

            Action::StopInput => self.input.stop(),
            Action::EnableReadable => ctl.enable(Readiness::READABLE),
            Action::DisableReadable => ctl.disable(Readiness::READABLE),
            Action::EnableWritable => ctl.enable(Readiness::WRITABLE | Readiness::ALL_WRITTEN),
            Action::DisableWritable => ctl.disable(Readiness::WRITABLE),

            Action::WriteChunk => match ctl.flow().write(self.chunk.filled()) {
                Ok(()) => {
                    trace!(len = self.chunk.len(), "chunk written to flow");

                    self.chunk.clear();
                    self.apply(ctl, RelayEvent::ChunkAccepted)?;
                }

                Err(FlowError::WouldBlock) => {
                    debug!(len = self.chunk.len(), "flow would block, keep chunk");

                    self.apply(ctl, RelayEvent::ChunkBlocked)?;
                }

                Err(err) => return self.fail(ctl, err, "write flow failed"),
            },

            Action::ShutdownFlow => {
                debug!("input finished, shut down flow");

                if let Err(err) = ctl.flow().shutdown() {
                    return self.fail(ctl, err, "shutdown flow failed");
                }
            }

            Action::StopLoop => ctl.stop_loop(),

            Action::Terminate => {
                self.input.stop();
                ctl.set_interest(Readiness::EMPTY);
            }
        }

        Ok(())
    }

    fn fail(
        &mut self,
        ctl: &mut FlowCtl<'_>,
        err: FlowError,
        context: &'static str,
    ) -> anyhow::Result<()> {
        self.apply(ctl, RelayEvent::Error)?;

        Err(anyhow::Error::new(err).context(context))
    }
}

impl<W: Write + Send> FlowHandler for FlowRelay<W> {
    fn on_connected(&mut self, ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        info!(peer = ?ctl.flow().peer_addr(), "flow connected");

        self.apply(ctl, RelayEvent::Connected)
    }

    fn on_readable(&mut self, ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        match ctl.flow().read(&mut self.recv_buf) {
            Ok(0) => {
                info!("peer closed flow");

                self.apply(ctl, RelayEvent::PeerClosed)
            }

            Ok(n) => {
                self.output
                    .write_all(&self.recv_buf[..n])
                    .with_context(|| "write output failed")?;
                self.output.flush().with_context(|| "flush output failed")?;

                Ok(())
            }

            Err(FlowError::WouldBlock) => {
                debug!("flow read would block");

                Ok(())
            }

            Err(err) => self.fail(ctl, err, "read flow failed"),
        }
    }

    fn on_writable(&mut self, ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        self.apply(ctl, RelayEvent::FlowWritable)
    }

    fn on_all_written(&mut self, ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        self.apply(ctl, RelayEvent::AllWritten)
    }

    fn on_error(&mut self, ctl: &mut FlowCtl<'_>, err: FlowError) -> anyhow::Result<()> {
        self.fail(ctl, err, "flow failed")
    }

    fn on_input(&mut self, ctl: &mut FlowCtl<'_>, input: Input) -> anyhow::Result<()> {
        match input {
            Input::Data(data) => {
                if self.state != RelayState::ReadingInput {
                    warn!(state = ?self.state, len = data.len(), "drop unexpected input");

                    return Ok(());
                }

                let n = self.chunk.fill(&data);
                if n < data.len() {
                    warn!(len = data.len(), kept = n, "input chunk truncated");
                }

                self.apply(ctl, RelayEvent::InputData)
            }

            Input::Eof => {
                debug!("input reached end");

                self.apply(ctl, RelayEvent::InputEof)
            }

            Input::Failed(err) => {
                self.apply(ctl, RelayEvent::Error)?;

                Err(anyhow::Error::new(err).context("read input failed"))
            }
        }
    }

    fn on_close(&mut self) {
        debug!(state = ?self.state, "relay flow closed");
    }
}

/// Relay `input` to `flow` and everything `flow` receives to `output`, until the peer closes.
#[instrument(level = "debug", skip_all, err(Debug))]
pub fn run_relay<W: Write + Send + 'static>(
    config: &RelayConfig,
    flow: Box<dyn Flow>,
    input: impl Read + Send + 'static,
    output: W,
) -> anyhow::Result<()> {
    let mut context = FlowContext::builder()
        .build()
        .with_context(|| "build flow context failed")?;

    context
        .register(
            flow,
            Box::new(FlowRelay::new(config, input, output)),
            Readiness::EMPTY,
        )
        .with_context(|| "register relay flow failed")?;

    context.run()
}
