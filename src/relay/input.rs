use std::io;
use std::io::{ErrorKind, Read};
use std::thread;

use bytes::BytesMut;
use derivative::Derivative;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, error};

use crate::context::{ContextHandle, FlowId, Input};

/// Reads an input source on its own thread, one chunk per permit.
///
/// Each [`start`](InputPump::start) lets the reader deliver at most one chunk to the flow's
/// [`on_input`](crate::context::FlowHandler::on_input), so a new chunk is never read while the
/// previous one is in flight.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct InputPump {
    chunk_size: usize,
    #[derivative(Debug = "ignore")]
    source: Option<Box<dyn Read + Send>>,
    permits: Option<Sender<()>>,
    armed: bool,
}

impl InputPump {
    pub fn new(source: impl Read + Send + 'static, chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            source: Some(Box::new(source)),
            permits: None,
            armed: false,
        }
    }

    /// Allow one more chunk to be read and posted to flow `id`.
    pub fn start(&mut self, id: FlowId, handle: &ContextHandle) -> io::Result<()> {
        if self.armed {
            return Ok(());
        }

        let permits = match self.permits.take() {
            Some(permits) => permits,
            None => self.spawn(id, handle.clone())?,
        };

        match permits.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!(?id, "input reader is gone");
            }
        }

        self.permits = Some(permits);
        self.armed = true;

        Ok(())
    }

    pub fn stop(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn spawn(&mut self, id: FlowId, handle: ContextHandle) -> io::Result<Sender<()>> {
        let source = self
            .source
            .take()
            .ok_or_else(|| io::Error::other("input source already taken"))?;
        let (tx, rx) = flume::bounded(1);
        let chunk_size = self.chunk_size;

        thread::Builder::new()
            .name("flow-input".to_string())
            .spawn(move || pump(source, chunk_size, rx, id, handle))?;

        Ok(tx)
    }
}

fn pump(
    mut source: Box<dyn Read + Send>,
    chunk_size: usize,
    permits: Receiver<()>,
    id: FlowId,
    handle: ContextHandle,
) {
    let mut buf = BytesMut::zeroed(chunk_size);

    while permits.recv().is_ok() {
        let input = loop {
            match source.read(&mut buf) {
                Ok(0) => break Input::Eof,
                Ok(n) => break Input::Data(buf.split_to(n).freeze()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(?id, %err, "read input failed");

                    break Input::Failed(err);
                }
            }
        };

        let last = !matches!(input, Input::Data(_));
        if handle.post_input(id, input).is_err() {
            debug!(?id, "flow context is gone, stop reading input");

            return;
        }
        if last {
            return;
        }

        if buf.len() < chunk_size {
            buf.resize(chunk_size, 0);
        }
    }
}
