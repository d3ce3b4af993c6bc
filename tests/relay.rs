use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flowsock::flow::memory::MemoryFlow;
use flowsock::relay::{run_relay, RelayConfig};
use flowsock::{Flow, FlowConfig, FlowContext, FlowError, RecvFlags, SendFlags, SocketApi};
use parking_lot::Mutex;

#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Echo everything the relay sends until it shuts down, then close. Returns what was received.
fn echo_peer(peer: MemoryFlow) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let context = FlowContext::builder().build().unwrap();
        let (handle, _thread) = context.spawn().unwrap();
        let api = SocketApi::new(handle);
        let fd = api.open_flow(Box::new(peer)).unwrap();

        let mut received = vec![];
        let mut buf = [0; 64];
        loop {
            let n = api.recv(fd, &mut buf, RecvFlags::empty()).unwrap();
            if n == 0 {
                break;
            }

            received.extend_from_slice(&buf[..n]);
            assert_eq!(api.send(fd, &buf[..n], SendFlags::empty()), Ok(n));
        }

        api.close(fd).unwrap();

        received
    })
}

#[test]
fn relays_input_and_echo() {
    let (local, peer) = MemoryFlow::pair(&FlowConfig::default());
    let peer = echo_peer(peer);
    let output = SharedOutput::default();

    run_relay(
        &RelayConfig::default(),
        Box::new(local),
        Cursor::new(b"hello\n".to_vec()),
        output.clone(),
    )
    .unwrap();

    assert_eq!(peer.join().unwrap(), b"hello\n");
    assert_eq!(output.contents(), b"hello\n");
}

#[test]
fn input_is_split_into_send_sized_chunks() {
    let input = b"the quick brown fox jumps over the lazy dog".to_vec();
    let (local, peer) = MemoryFlow::pair(&FlowConfig::default());
    let peer = echo_peer(peer);
    let output = SharedOutput::default();

    let mut config = RelayConfig::default();
    config.send_buffer_size(4).recv_buffer_size(3);

    run_relay(
        &config,
        Box::new(local),
        Cursor::new(input.clone()),
        output.clone(),
    )
    .unwrap();

    assert_eq!(peer.join().unwrap(), input);
    assert_eq!(output.contents(), input);
}

#[test]
fn blocked_chunk_is_written_once() {
    let (local, peer) = MemoryFlow::pair(&FlowConfig::default());
    local.faults().fail_next_write(FlowError::WouldBlock);
    let peer = echo_peer(peer);
    let output = SharedOutput::default();

    run_relay(
        &RelayConfig::default(),
        Box::new(local),
        Cursor::new(b"hello\n".to_vec()),
        output.clone(),
    )
    .unwrap();

    assert_eq!(peer.join().unwrap(), b"hello\n");
    assert_eq!(output.contents(), b"hello\n");
}

#[test]
fn empty_input_still_receives() {
    let (local, mut peer) = MemoryFlow::pair(&FlowConfig::default());
    let output = SharedOutput::default();

    peer.write(b"greeting").unwrap();
    peer.shutdown().unwrap();

    run_relay(
        &RelayConfig::default(),
        Box::new(local),
        io::empty(),
        output.clone(),
    )
    .unwrap();

    assert_eq!(output.contents(), b"greeting");
}

#[test]
fn flow_failure_terminates_relay() {
    let (local, _peer) = MemoryFlow::pair(&FlowConfig::default());
    local
        .faults()
        .raise(FlowError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));

    let err = run_relay(
        &RelayConfig::default(),
        Box::new(local),
        io::empty(),
        SharedOutput::default(),
    )
    .unwrap_err();

    assert!(format!("{err:#}").contains("flow failed"), "{err:#}");
}
