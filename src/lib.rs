#![doc = include_str!("../README.md")]

#[doc(inline)]
pub use context::{
    ContextHandle, FlowContext, FlowContextBuilder, FlowCtl, FlowHandle, FlowHandler, FlowId, Input,
};
#[doc(inline)]
pub use error::{ContextClosed, Direction, FlowError, FlowResult, SocketError};
#[doc(inline)]
pub use flow::{Flow, FlowConfig, FlowProperties, Readiness};
#[doc(inline)]
pub use socket::{Descriptor, RecvFlags, SendFlags, SocketApi};
#[doc(inline)]
pub use waiter::{ReadinessWaiter, WaitOutcome};

pub mod context;
pub mod error;
pub mod flow;
mod notify_channel;
pub mod relay;
pub mod socket;
pub mod waiter;
