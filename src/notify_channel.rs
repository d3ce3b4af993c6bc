use std::sync::Arc;

use crossbeam_channel::{Receiver, SendError, Sender, TryRecvError};
use tracing::error;

/// Sending half of the context command queue, every send wakes the context poller.
#[derive(Debug)]
pub struct NotifySender<T> {
    sender: Sender<T>,
    waker: Arc<mio::Waker>,
}

impl<T> Clone for NotifySender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<T> NotifySender<T> {
    pub fn send(&self, v: T) -> Result<(), SendError<T>> {
        self.sender.send(v)?;
        if let Err(err) = self.waker.wake() {
            error!(%err, "wake flow context failed");
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct NotifyReceiver<T> {
    receiver: Receiver<T>,
}

impl<T> NotifyReceiver<T> {
    pub fn collect_nonblock(&mut self) -> Result<Vec<T>, TryRecvError> {
        let mut items = Vec::with_capacity(self.receiver.len());
        loop {
            match self.receiver.try_recv() {
                Ok(item) => {
                    items.push(item);
                }
                Err(TryRecvError::Disconnected) => return Err(TryRecvError::Disconnected),
                Err(TryRecvError::Empty) => break,
            }
        }

        Ok(items)
    }
}

pub fn channel<T>(waker: Arc<mio::Waker>) -> (NotifySender<T>, NotifyReceiver<T>) {
    let (sender, receiver) = crossbeam_channel::unbounded();

    (NotifySender { sender, waker }, NotifyReceiver { receiver })
}
