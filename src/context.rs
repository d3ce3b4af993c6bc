//! Single threaded flow event loop.
//!
//! A [`FlowContext`] owns every registered [`Flow`] and runs the [`FlowHandler`] callbacks on its
//! own thread. Other threads talk to it through a cloneable [`ContextHandle`], which queues
//! commands and wakes the poller.

use std::collections::HashMap;
use std::io;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use derivative::Derivative;
use mio::{Events, Poll, Token};
use parking_lot::Mutex;
use tracing::{debug, error, instrument, trace};

use crate::error::{ContextClosed, FlowError};
use crate::flow::{Flow, LoopWaker, Readiness};
use crate::notify_channel::{self, NotifyReceiver, NotifySender};

const EVENTS_CAPACITY: usize = 1024;
const WAKER_TOKEN: Token = Token(0);

/// A flow shared between the context and bridge caller threads.
pub type SharedFlow = Arc<Mutex<Box<dyn Flow>>>;

/// Context assigned flow identifier
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FlowId(usize);

impl FlowId {
    fn token(self) -> Token {
        Token(self.0)
    }
}

/// Non-owning reference to a registered flow.
///
/// The context owns the flow, once it is closed [`with_flow`](FlowHandle::with_flow) returns
/// `None`.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct FlowHandle {
    id: FlowId,
    #[derivative(Debug = "ignore")]
    flow: Weak<Mutex<Box<dyn Flow>>>,
}

impl FlowHandle {
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Run `f` with the flow locked, `None` when the flow is gone.
    pub fn with_flow<R>(&self, f: impl FnOnce(&mut dyn Flow) -> R) -> Option<R> {
        let flow = self.flow.upgrade()?;
        let mut flow = flow.lock();

        Some(f(flow.as_mut()))
    }
}

/// Data arriving from an input source attached to a flow handler.
#[derive(Debug)]
pub enum Input {
    Data(Bytes),
    Eof,
    Failed(io::Error),
}

/// Flow lifecycle callbacks, always invoked on the context thread.
///
/// Callbacks must not block. Returning an error stops the context, [`FlowContext::run`] returns
/// it.
pub trait FlowHandler: Send {
    fn on_connected(&mut self, _ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called while the flow is readable and [`Readiness::READABLE`] is in the interest.
    fn on_readable(&mut self, _ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called while the flow is writable and [`Readiness::WRITABLE`] is in the interest.
    fn on_writable(&mut self, _ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once written data was handed off, needs [`Readiness::ALL_WRITTEN`] interest.
    fn on_all_written(&mut self, _ctl: &mut FlowCtl<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&mut self, _ctl: &mut FlowCtl<'_>, err: FlowError) -> anyhow::Result<()> {
        Err(anyhow::Error::new(err).context("flow failed"))
    }

    fn on_input(&mut self, _ctl: &mut FlowCtl<'_>, _input: Input) -> anyhow::Result<()> {
        Ok(())
    }

    /// The flow was removed from the context.
    fn on_close(&mut self) {}
}

/// Access to a flow and its callback registration from inside a [`FlowHandler`] callback.
pub struct FlowCtl<'a> {
    id: FlowId,
    flow: &'a mut Box<dyn Flow>,
    interest: &'a mut Readiness,
    stop: &'a mut bool,
    handle: &'a ContextHandle,
}

impl FlowCtl<'_> {
    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn flow(&mut self) -> &mut dyn Flow {
        self.flow.as_mut()
    }

    pub fn interest(&self) -> Readiness {
        *self.interest
    }

    /// Replace the callbacks this flow receives.
    pub fn set_interest(&mut self, interest: Readiness) {
        *self.interest = interest;
    }

    pub fn enable(&mut self, interest: Readiness) {
        self.interest.insert(interest);
    }

    pub fn disable(&mut self, interest: Readiness) {
        self.interest.remove(interest);
    }

    /// Stop the context after the current callback returns.
    pub fn stop_loop(&mut self) {
        *self.stop = true;
    }

    pub fn handle(&self) -> &ContextHandle {
        self.handle
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
enum Command {
    Register {
        id: FlowId,
        #[derivative(Debug = "ignore")]
        flow: SharedFlow,
        #[derivative(Debug = "ignore")]
        handler: Box<dyn FlowHandler>,
        interest: Readiness,
    },

    Interest {
        id: FlowId,
        op: InterestOp,
    },

    Input {
        id: FlowId,
        input: Input,
    },

    Close(FlowId),

    Stop,
}

#[derive(Debug, Copy, Clone)]
enum InterestOp {
    Set(Readiness),
    Add(Readiness),
    Remove(Readiness),
}

#[derive(Debug)]
struct Shared {
    commands: NotifySender<Command>,
    next_id: AtomicUsize,
}

/// Cloneable handle to a [`FlowContext`], usable from any thread.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    shared: Arc<Shared>,
}

impl ContextHandle {
    /// Hand `flow` over to the context, `handler` receives its callbacks.
    pub fn register(
        &self,
        flow: Box<dyn Flow>,
        handler: Box<dyn FlowHandler>,
        interest: Readiness,
    ) -> Result<FlowHandle, ContextClosed> {
        let id = FlowId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let flow = Arc::new(Mutex::new(flow));
        let handle = FlowHandle {
            id,
            flow: Arc::downgrade(&flow),
        };

        self.send(Command::Register {
            id,
            flow,
            handler,
            interest,
        })?;

        Ok(handle)
    }

    pub fn set_interest(&self, id: FlowId, interest: Readiness) -> Result<(), ContextClosed> {
        self.send(Command::Interest {
            id,
            op: InterestOp::Set(interest),
        })
    }

    pub fn add_interest(&self, id: FlowId, interest: Readiness) -> Result<(), ContextClosed> {
        self.send(Command::Interest {
            id,
            op: InterestOp::Add(interest),
        })
    }

    pub fn remove_interest(&self, id: FlowId, interest: Readiness) -> Result<(), ContextClosed> {
        self.send(Command::Interest {
            id,
            op: InterestOp::Remove(interest),
        })
    }

    /// Deliver `input` to the flow handler's [`on_input`](FlowHandler::on_input).
    pub fn post_input(&self, id: FlowId, input: Input) -> Result<(), ContextClosed> {
        self.send(Command::Input { id, input })
    }

    /// Close and remove a flow, its handler gets [`on_close`](FlowHandler::on_close).
    pub fn close(&self, id: FlowId) -> Result<(), ContextClosed> {
        self.send(Command::Close(id))
    }

    pub fn stop(&self) -> Result<(), ContextClosed> {
        self.send(Command::Stop)
    }

    fn send(&self, command: Command) -> Result<(), ContextClosed> {
        self.shared.commands.send(command).map_err(|_| ContextClosed)
    }
}

/// a [`FlowContext`] builder
#[derive(Debug, Clone, Default)]
pub struct FlowContextBuilder {
    events_capacity: Option<usize>,
    poll_interval: Option<Duration>,
}

impl FlowContextBuilder {
    /// Set how many poller events are taken per iteration, default is 1024
    pub fn events_capacity(&mut self, capacity: usize) -> &mut Self {
        self.events_capacity = Some(capacity);
        self
    }

    /// Set the longest time the context sleeps without events, default is forever
    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Build a [`FlowContext`]
    pub fn build(&self) -> anyhow::Result<FlowContext> {
        let capacity = self.events_capacity.unwrap_or(EVENTS_CAPACITY);
        if capacity == 0 {
            return Err(anyhow::anyhow!("events capacity must not be zero"));
        }

        FlowContext::new(capacity, self.poll_interval)
    }
}

struct FlowEntry {
    flow: SharedFlow,
    handler: Box<dyn FlowHandler>,
    interest: Readiness,
    connected: bool,
}

/// The flow event loop
pub struct FlowContext {
    poll: Poll,
    events: Events,
    poll_interval: Option<Duration>,
    waker: LoopWaker,

    flows: HashMap<FlowId, FlowEntry>,
    commands: NotifyReceiver<Command>,
    handle: ContextHandle,

    running: bool,
}

impl FlowContext {
    /// Create a [`FlowContextBuilder`]
    pub fn builder() -> FlowContextBuilder {
        Default::default()
    }

    fn new(capacity: usize, poll_interval: Option<Duration>) -> anyhow::Result<Self> {
        let poll = Poll::new().with_context(|| "create poller failed")?;
        let waker = Arc::new(
            mio::Waker::new(poll.registry(), WAKER_TOKEN)
                .with_context(|| "create poller waker failed")?,
        );
        let (tx, rx) = notify_channel::channel(waker.clone());

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            poll_interval,
            waker,
            flows: Default::default(),
            commands: rx,
            handle: ContextHandle {
                shared: Arc::new(Shared {
                    commands: tx,
                    next_id: AtomicUsize::new(WAKER_TOKEN.0 + 1),
                }),
            },
            running: false,
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Register a flow, it is attached when the loop runs.
    pub fn register(
        &self,
        flow: Box<dyn Flow>,
        handler: Box<dyn FlowHandler>,
        interest: Readiness,
    ) -> Result<FlowHandle, ContextClosed> {
        self.handle.register(flow, handler, interest)
    }

    /// Number of live flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Run the context on a dedicated thread.
    pub fn spawn(mut self) -> io::Result<(ContextHandle, JoinHandle<anyhow::Result<()>>)> {
        let handle = self.handle();
        let thread = thread::Builder::new()
            .name("flow-context".to_string())
            .spawn(move || self.run())?;

        Ok((handle, thread))
    }

    /// Drive the event loop until stopped or a handler fails
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.running = true;

        let mut timeout = self.poll_interval;
        while self.running {
            timeout = self.drive_one(timeout)?;
        }

        debug!("flow context stopped");

        Ok(())
    }

    #[instrument(level = "trace", skip(self), err(Debug))]
    fn drive_one(&mut self, timeout: Option<Duration>) -> anyhow::Result<Option<Duration>> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(Some(Duration::ZERO));
            }

            return Err(err).with_context(|| "poll flow events failed");
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }

            match self.flows.get(&FlowId(event.token().0)) {
                None => trace!(?event, "event of unknown flow"),
                Some(entry) => entry.flow.lock().handle_event(event),
            }
        }

        let commands = self
            .commands
            .collect_nonblock()
            .with_context(|| "broken flow command queue")?;
        for command in commands {
            self.handle_command(command)?;
        }

        let mut progressed = false;
        let mut ids = self.flows.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        for id in ids {
            if !self.running {
                break;
            }

            progressed |= self.dispatch(id)?;
        }

        if progressed {
            return Ok(Some(Duration::ZERO));
        }

        Ok(self.poll_interval)
    }

    #[instrument(level = "debug", skip(self), err(Debug))]
    fn handle_command(&mut self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Register {
                id,
                flow,
                handler,
                interest,
            } => {
                let res = flow
                    .lock()
                    .register(self.poll.registry(), id.token(), &self.waker);

                self.flows.insert(
                    id,
                    FlowEntry {
                        flow,
                        handler,
                        interest,
                        connected: false,
                    },
                );

                debug!(?id, "register flow done");

                if let Err(err) = res {
                    error!(?id, %err, "register flow failed");

                    self.deliver_error(id, err)?;
                }
            }

            Command::Interest { id, op } => match self.flows.get_mut(&id) {
                None => debug!(?id, ?op, "interest change of unknown flow"),
                Some(entry) => match op {
                    InterestOp::Set(interest) => entry.interest = interest,
                    InterestOp::Add(interest) => entry.interest.insert(interest),
                    InterestOp::Remove(interest) => entry.interest.remove(interest),
                },
            },

            Command::Input { id, input } => {
                if !self.flows.contains_key(&id) {
                    debug!(?id, ?input, "input of unknown flow");

                    return Ok(());
                }

                let stop = self.with_ctl(id, |handler, ctl| handler.on_input(ctl, input))?;
                if stop {
                    self.running = false;
                }
            }

            Command::Close(id) => self.remove_flow(id),

            Command::Stop => {
                self.running = false;
            }
        }

        Ok(())
    }

    fn deliver_error(&mut self, id: FlowId, err: FlowError) -> anyhow::Result<()> {
        let stop = self.with_ctl(id, |handler, ctl| handler.on_error(ctl, err))?;
        if stop {
            self.running = false;
        }

        Ok(())
    }

    /// Run `f` against a flow's handler, returns whether the handler asked to stop.
    fn with_ctl(
        &mut self,
        id: FlowId,
        f: impl FnOnce(&mut dyn FlowHandler, &mut FlowCtl<'_>) -> anyhow::Result<()>,
    ) -> anyhow::Result<bool> {
        let Some(entry) = self.flows.get_mut(&id) else {
            return Ok(false);
        };

        let shared = entry.flow.clone();
        let mut flow = shared.lock();
        let mut stop = false;
        let mut ctl = FlowCtl {
            id,
            flow: &mut flow,
            interest: &mut entry.interest,
            stop: &mut stop,
            handle: &self.handle,
        };

        f(entry.handler.as_mut(), &mut ctl)?;

        Ok(stop)
    }

    /// Deliver the callbacks the flow's state and interest call for, returns whether any fired.
    fn dispatch(&mut self, id: FlowId) -> anyhow::Result<bool> {
        let Some(entry) = self.flows.get_mut(&id) else {
            return Ok(false);
        };

        let FlowEntry {
            flow,
            handler,
            interest,
            connected,
        } = entry;
        let shared = flow.clone();
        let mut flow = shared.lock();
        let mut stop = false;
        let mut fired = false;
        let mut ctl = FlowCtl {
            id,
            flow: &mut flow,
            interest,
            stop: &mut stop,
            handle: &self.handle,
        };

        let failure = match ctl.flow().flush_pending() {
            Err(err) => Some(err),
            Ok(()) => ctl.flow().take_error(),
        };

        if let Some(err) = failure {
            debug!(?id, %err, "flow failed");

            fired = true;
            handler.on_error(&mut ctl, err)?;
        } else if !*connected && ctl.flow().is_connected() {
            debug!(?id, "flow connected");

            *connected = true;
            fired = true;
            handler.on_connected(&mut ctl)?;
        }

        if *connected && !*ctl.stop {
            let ready = ctl.flow().readiness();

            if ctl.interest().contains(Readiness::READABLE) && ready.contains(Readiness::READABLE)
            {
                fired = true;
                handler.on_readable(&mut ctl)?;
            }

            if !*ctl.stop
                && ctl.interest().contains(Readiness::WRITABLE)
                && ctl.flow().readiness().contains(Readiness::WRITABLE)
            {
                fired = true;
                handler.on_writable(&mut ctl)?;
            }

            if !*ctl.stop && ctl.flow().take_all_written() {
                fired = true;

                if ctl.interest().contains(Readiness::ALL_WRITTEN) {
                    handler.on_all_written(&mut ctl)?;
                }
            }
        }

        drop(flow);

        if stop {
            self.running = false;
        }

        Ok(fired)
    }

    #[instrument(level = "debug", skip(self))]
    fn remove_flow(&mut self, id: FlowId) {
        let Some(mut entry) = self.flows.remove(&id) else {
            debug!(?id, "close unknown flow");

            return;
        };

        {
            let mut flow = entry.flow.lock();
            if let Err(err) = flow.deregister(self.poll.registry()) {
                debug!(?id, %err, "deregister flow failed");
            }
            flow.close();
        }

        entry.handler.on_close();

        debug!(?id, "remove flow done");
    }
}

impl Drop for FlowContext {
    fn drop(&mut self) {
        let ids = self.flows.keys().copied().collect::<Vec<_>>();
        for id in ids {
            self.remove_flow(id);
        }

        // queued registrations never reached the loop, dropping them drops their handlers
        let _ = self.commands.collect_nonblock();
    }
}
