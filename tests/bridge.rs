use std::io::{self, IoSlice, IoSliceMut};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flowsock::flow::memory::{MemoryFaults, MemoryFlow};
use flowsock::{
    Descriptor, Flow, FlowConfig, FlowContext, FlowError, Readiness, RecvFlags, SendFlags,
    SocketApi, SocketError,
};

fn bridge(capacity: usize) -> (SocketApi, Descriptor, MemoryFlow, MemoryFaults) {
    let context = FlowContext::builder().build().unwrap();
    let (handle, _thread) = context.spawn().unwrap();
    let api = SocketApi::new(handle);

    let mut config = FlowConfig::default();
    config.send_buffer_size(capacity);
    let (local, peer) = MemoryFlow::pair(&config);
    let faults = local.faults();
    let fd = api.open_flow(Box::new(local)).unwrap();

    (api, fd, peer, faults)
}

/// Read from an unregistered flow until `len` bytes arrived.
fn read_exact(peer: &mut MemoryFlow, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut data = vec![];
    let mut buf = [0; 64];

    while data.len() < len {
        assert!(Instant::now() < deadline, "peer read timed out");

        match peer.read(&mut buf) {
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(err) if err.is_would_block() => thread::sleep(Duration::from_millis(5)),
            Err(err) => panic!("peer read failed: {err}"),
        }
    }

    data
}

#[test]
fn blocking_send_waits_for_space() {
    let (api, fd, mut peer, _) = bridge(8);

    assert_eq!(api.send(fd, &[1; 8], SendFlags::empty()), Ok(8));

    let drainer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let data = read_exact(&mut peer, 16);
        (data, peer)
    });

    let start = Instant::now();
    assert_eq!(api.send(fd, &[2; 8], SendFlags::empty()), Ok(8));
    assert!(start.elapsed() >= Duration::from_millis(90));

    let (data, mut peer) = drainer.join().unwrap();
    assert_eq!(data[..8], [1u8; 8]);
    assert_eq!(data[8..], [2u8; 8]);
    assert!(peer.read(&mut [0; 8]).unwrap_err().is_would_block());
}

#[test]
fn blocking_recv_waits_for_data() {
    let (api, fd, mut peer, _) = bridge(64);

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        peer.write(b"hello").unwrap();
        peer
    });

    let mut buf = [0; 16];
    let n = api.recv(fd, &mut buf, RecvFlags::empty()).unwrap();
    assert_eq!(&buf[..n], b"hello");

    assert_eq!(
        api.recvfrom(fd, &mut [0; 4], RecvFlags::DONTWAIT),
        Err(SocketError::WouldBlock)
    );

    drop(writer.join().unwrap());
}

#[test]
fn nonblocking_calls_never_wait() {
    let (api, fd, _peer, _) = bridge(4);

    assert_eq!(api.write(fd, b"full"), Ok(4));

    api.set_nonblocking(fd, true).unwrap();
    let start = Instant::now();
    assert_eq!(api.write(fd, b"more"), Err(SocketError::WouldBlock));
    assert_eq!(
        api.recv(fd, &mut [0; 4], RecvFlags::empty()),
        Err(SocketError::WouldBlock)
    );

    api.set_nonblocking(fd, false).unwrap();
    assert_eq!(
        api.send(fd, b"more", SendFlags::DONTWAIT),
        Err(SocketError::WouldBlock)
    );
    assert_eq!(
        api.recv(fd, &mut [0; 4], RecvFlags::DONTWAIT),
        Err(SocketError::WouldBlock)
    );
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn peer_shutdown_reads_as_repeated_eof() {
    let (api, fd, mut peer, _) = bridge(64);

    peer.write(&[7; 10]).unwrap();
    peer.shutdown().unwrap();

    let mut buf = [0; 64];
    assert_eq!(api.recv(fd, &mut buf, RecvFlags::empty()), Ok(10));
    assert_eq!(api.recv(fd, &mut buf, RecvFlags::empty()), Ok(0));

    drop(peer);
    assert_eq!(api.read(fd, &mut buf), Ok(0));
    assert_eq!(api.recv(fd, &mut buf, RecvFlags::empty()), Ok(0));
}

#[test]
fn read_timeout_expires() {
    let (api, fd, mut peer, _) = bridge(64);
    api.set_read_timeout(fd, Some(Duration::from_millis(50)))
        .unwrap();

    let start = Instant::now();
    assert_eq!(
        api.recv(fd, &mut [0; 8], RecvFlags::empty()),
        Err(SocketError::TimedOut)
    );
    assert!(start.elapsed() >= Duration::from_millis(50));

    peer.write(b"late").unwrap();
    api.set_read_timeout(fd, None).unwrap();

    let mut buf = [0; 8];
    let n = api.recv(fd, &mut buf, RecvFlags::empty()).unwrap();
    assert_eq!(&buf[..n], b"late");
}

#[test]
fn close_wakes_blocked_receiver() {
    let (api, fd, _peer, _) = bridge(64);
    let api = Arc::new(api);

    let receiver = thread::spawn({
        let api = api.clone();
        move || api.recv(fd, &mut [0; 8], RecvFlags::empty())
    });

    thread::sleep(Duration::from_millis(50));
    api.close(fd).unwrap();

    assert_eq!(receiver.join().unwrap(), Err(SocketError::BadDescriptor));
    assert_eq!(
        api.send(fd, b"x", SendFlags::empty()),
        Err(SocketError::BadDescriptor)
    );
    assert_eq!(api.close(fd), Err(SocketError::BadDescriptor));
}

#[test]
fn blocked_send_and_recv_take_turns() {
    let (api, fd, _peer, _) = bridge(4);
    assert_eq!(api.write(fd, b"full"), Ok(4));

    api.set_read_timeout(fd, Some(Duration::from_millis(150)))
        .unwrap();
    api.set_write_timeout(fd, Some(Duration::from_millis(150)))
        .unwrap();
    let api = Arc::new(api);

    let start = Instant::now();
    let receiver = thread::spawn({
        let api = api.clone();
        move || api.recv(fd, &mut [0; 8], RecvFlags::empty())
    });

    assert_eq!(
        api.send(fd, b"more", SendFlags::empty()),
        Err(SocketError::TimedOut)
    );
    assert_eq!(receiver.join().unwrap(), Err(SocketError::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(290));
}

#[test]
fn second_would_block_is_reported() {
    let (api, fd, mut peer, faults) = bridge(8);
    assert_eq!(api.send(fd, &[1; 8], SendFlags::empty()), Ok(8));

    let drainer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        faults.fail_next_write(FlowError::WouldBlock);
        let data = read_exact(&mut peer, 8);
        (data, peer)
    });

    assert_eq!(
        api.send(fd, &[2; 8], SendFlags::empty()),
        Err(SocketError::WouldBlock)
    );

    let (data, mut peer) = drainer.join().unwrap();
    assert_eq!(data, [1u8; 8]);
    assert!(peer.read(&mut [0; 8]).unwrap_err().is_would_block());
}

#[test]
fn transport_errors_are_translated() {
    let (api, fd, _peer, faults) = bridge(64);

    faults.fail_next_write(FlowError::OutOfMemory);
    assert_eq!(api.write(fd, b"x"), Err(SocketError::NoMemory));

    faults.fail_next_write(FlowError::MessageTooBig);
    assert_eq!(api.write(fd, b"x"), Err(SocketError::Unexpected));

    faults.fail_next_write(FlowError::Unrecognized(99));
    let err = api.write(fd, b"x").unwrap_err();
    assert_eq!(err, SocketError::Unexpected);
    assert_eq!(
        io::Error::from(err).raw_os_error(),
        Some(rustix::io::Errno::NOENT.raw_os_error())
    );

    faults.fail_next_read(FlowError::MessageTooBig);
    assert_eq!(api.read(fd, &mut [0; 4]), Err(SocketError::MessageTooBig));

    faults.fail_next_read(FlowError::OutOfMemory);
    assert_eq!(api.read(fd, &mut [0; 4]), Err(SocketError::Unexpected));

    faults.fail_next_read(FlowError::BadArgument);
    assert_eq!(
        api.read(fd, &mut [0; 4]),
        Err(SocketError::InvalidArgument)
    );
}

#[test]
fn flow_failure_fails_blocked_calls() {
    let (api, fd, _peer, faults) = bridge(64);
    let api = Arc::new(api);

    let receiver = thread::spawn({
        let api = api.clone();
        move || api.recv(fd, &mut [0; 8], RecvFlags::empty())
    });

    thread::sleep(Duration::from_millis(30));
    faults.raise(FlowError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));

    assert_eq!(receiver.join().unwrap(), Err(SocketError::Io));
    assert_eq!(api.write(fd, b"x"), Err(SocketError::Io));
}

#[test]
fn poll_reports_readiness() {
    let (api, fd, mut peer, _) = bridge(64);

    assert!(api
        .poll(fd, Readiness::WRITABLE, Some(Duration::ZERO))
        .unwrap()
        .contains(Readiness::WRITABLE));
    assert_eq!(
        api.poll(fd, Readiness::READABLE, Some(Duration::from_millis(20))),
        Ok(Readiness::EMPTY)
    );

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        peer.write(b"ready").unwrap();
        peer
    });

    assert_eq!(
        api.poll(fd, Readiness::READABLE, None),
        Ok(Readiness::READABLE)
    );

    drop(writer.join().unwrap());
}

#[test]
fn single_segment_vectors_are_bridged() {
    let (api, fd, mut peer, _) = bridge(64);

    assert_eq!(api.writev(fd, &[IoSlice::new(b"vec")]), Ok(3));
    assert_eq!(
        api.sendmsg(fd, &[IoSlice::new(b"msg")], SendFlags::empty()),
        Ok(3)
    );
    assert_eq!(read_exact(&mut peer, 6), b"vecmsg");

    peer.write(b"back").unwrap();
    let mut buf = [0; 8];
    assert_eq!(
        api.recvmsg(fd, &mut [IoSliceMut::new(&mut buf)], RecvFlags::empty()),
        Ok(4)
    );
    assert_eq!(&buf[..4], b"back");
}

#[test]
#[should_panic(expected = "scatter/gather I/O is not implemented")]
fn multi_segment_write_panics() {
    let (api, fd, _peer, _) = bridge(64);

    let _ = api.writev(fd, &[IoSlice::new(b"a"), IoSlice::new(b"b")]);
}

#[test]
#[should_panic(expected = "scatter/gather I/O is not implemented")]
fn empty_segment_list_panics() {
    let (api, fd, _peer, _) = bridge(64);

    let _ = api.readv(fd, &mut []);
}
