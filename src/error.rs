//! Transport result codes and their socket-level translation.

use std::io;
use std::io::ErrorKind;

use rustix::io::Errno;
use thiserror::Error;

/// Result of a flow operation.
pub type FlowResult<T> = Result<T, FlowError>;

/// Result codes returned by the transport layer.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The operation made no progress and must be retried later.
    #[error("flow operation would block")]
    WouldBlock,

    #[error("flow io failed: {0}")]
    Io(#[source] io::Error),

    #[error("message too big")]
    MessageTooBig,

    #[error("bad argument")]
    BadArgument,

    #[error("out of memory")]
    OutOfMemory,

    /// A status the transport produced that has no defined meaning here.
    #[error("unrecognized transport status {0}")]
    Unrecognized(i32),
}

impl FlowError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, FlowError::WouldBlock)
    }
}

impl From<io::Error> for FlowError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock => FlowError::WouldBlock,
            ErrorKind::InvalidInput => FlowError::BadArgument,
            ErrorKind::OutOfMemory => FlowError::OutOfMemory,
            _ => FlowError::Io(err),
        }
    }
}

/// Which side of the bridge produced a transport result.
///
/// The translation table differs per direction: a transmit can not report a too big message and
/// a receive can not run out of memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Errors reported by the socket call surface, each with a POSIX errno counterpart.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SocketError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    TimedOut,

    #[error("input/output error")]
    Io,

    #[error("message too long")]
    MessageTooBig,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("cannot allocate memory")]
    NoMemory,

    #[error("bad socket descriptor")]
    BadDescriptor,

    /// The transport returned a result the translation table doesn't cover.
    #[error("unexpected transport result")]
    Unexpected,

    /// Error of a passthrough descriptor, as returned by the host OS.
    #[error("os error: {0}")]
    Os(Errno),
}

impl SocketError {
    /// The errno a POSIX caller would observe.
    pub fn errno(&self) -> Errno {
        match self {
            SocketError::WouldBlock => Errno::AGAIN,
            SocketError::TimedOut => Errno::TIMEDOUT,
            SocketError::Io => Errno::IO,
            SocketError::MessageTooBig => Errno::MSGSIZE,
            SocketError::InvalidArgument => Errno::INVAL,
            SocketError::NoMemory => Errno::NOMEM,
            SocketError::BadDescriptor => Errno::BADF,
            SocketError::Unexpected => Errno::NOENT,
            SocketError::Os(errno) => *errno,
        }
    }
}

impl From<SocketError> for io::Error {
    fn from(err: SocketError) -> Self {
        io::Error::from_raw_os_error(err.errno().raw_os_error())
    }
}

/// Translate a transport result into the error a socket caller sees.
///
/// First match wins; anything outside the table for `direction` is [`SocketError::Unexpected`].
pub fn translate(direction: Direction, err: &FlowError) -> SocketError {
    match (direction, err) {
        (_, FlowError::WouldBlock) => SocketError::WouldBlock,
        (_, FlowError::Io(_)) => SocketError::Io,
        (Direction::Receive, FlowError::MessageTooBig) => SocketError::MessageTooBig,
        (_, FlowError::BadArgument) => SocketError::InvalidArgument,
        (Direction::Transmit, FlowError::OutOfMemory) => SocketError::NoMemory,
        _ => SocketError::Unexpected,
    }
}

/// The flow context is gone, commands can no longer be delivered.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("flow context is closed")]
pub struct ContextClosed;

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn flow_error(code: u8) -> FlowError {
        match code % 7 {
            0 => FlowError::WouldBlock,
            1 => FlowError::Io(io::Error::from(ErrorKind::ConnectionReset)),
            2 => FlowError::MessageTooBig,
            3 => FlowError::BadArgument,
            4 => FlowError::OutOfMemory,
            5 => FlowError::Unrecognized(code as i32),
            _ => FlowError::Unrecognized(-1),
        }
    }

    #[test]
    fn transmit_table() {
        let cases = [
            (FlowError::WouldBlock, SocketError::WouldBlock),
            (FlowError::Io(io::Error::other("broken")), SocketError::Io),
            (FlowError::BadArgument, SocketError::InvalidArgument),
            (FlowError::OutOfMemory, SocketError::NoMemory),
            (FlowError::MessageTooBig, SocketError::Unexpected),
            (FlowError::Unrecognized(42), SocketError::Unexpected),
        ];

        for (err, expected) in cases {
            assert_eq!(translate(Direction::Transmit, &err), expected, "{err:?}");
        }
    }

    #[test]
    fn receive_table() {
        let cases = [
            (FlowError::WouldBlock, SocketError::WouldBlock),
            (FlowError::Io(io::Error::other("broken")), SocketError::Io),
            (FlowError::MessageTooBig, SocketError::MessageTooBig),
            (FlowError::BadArgument, SocketError::InvalidArgument),
            (FlowError::OutOfMemory, SocketError::Unexpected),
            (FlowError::Unrecognized(42), SocketError::Unexpected),
        ];

        for (err, expected) in cases {
            assert_eq!(translate(Direction::Receive, &err), expected, "{err:?}");
        }
    }

    #[test]
    fn unexpected_errno_is_distinct() {
        let others = [
            SocketError::WouldBlock,
            SocketError::TimedOut,
            SocketError::Io,
            SocketError::MessageTooBig,
            SocketError::InvalidArgument,
            SocketError::NoMemory,
            SocketError::BadDescriptor,
        ];

        for err in others {
            assert_ne!(err.errno(), SocketError::Unexpected.errno());
        }
        assert_eq!(SocketError::WouldBlock.errno(), Errno::AGAIN);
        assert_eq!(SocketError::TimedOut.errno(), Errno::TIMEDOUT);
    }

    #[test]
    fn io_error_kinds_collapse_into_flow_codes() {
        assert!(FlowError::from(io::Error::from(ErrorKind::WouldBlock)).is_would_block());
        assert!(matches!(
            FlowError::from(io::Error::from(ErrorKind::InvalidInput)),
            FlowError::BadArgument
        ));
        assert!(matches!(
            FlowError::from(io::Error::from(ErrorKind::BrokenPipe)),
            FlowError::Io(_)
        ));
    }

    #[test]
    fn socket_error_converts_to_os_error() {
        let err = io::Error::from(SocketError::WouldBlock);
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    proptest! {
        #[test]
        fn translation_ignores_history(history in proptest::collection::vec(any::<u8>(), 0..32), code in any::<u8>()) {
            let first_tx = translate(Direction::Transmit, &flow_error(code));
            let first_rx = translate(Direction::Receive, &flow_error(code));

            for past in history {
                let _ = translate(Direction::Transmit, &flow_error(past));
                let _ = translate(Direction::Receive, &flow_error(past));
            }

            prop_assert_eq!(translate(Direction::Transmit, &flow_error(code)), first_tx);
            prop_assert_eq!(translate(Direction::Receive, &flow_error(code)), first_rx);
        }
    }
}
