use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use visorbus::header::{CHANNEL_HEADER_SIZE, VISOR_CHANNEL_SIGNATURE};
use visorbus::signal_queue::{SIGNAL_QUEUE_HEADER_SIZE, init_queue};
use visorbus::{
    Channel, ChannelError, ChannelExpectation, ChannelHeader, ClientState, Guid,
    RecordingDiagnostics, ServerState, SharedRegion, SignalQueueHeader,
};

const TEST_TYPE: Guid = Guid::new(0x5eed_0001, 0x1111, 0x2222, [9, 8, 7, 6, 5, 4, 3, 2]);
const SIGNAL_SIZE: u32 = 64;
const MAX_SLOTS: u32 = 16;
const QUEUES: u32 = 2;
const CHANNEL_SIZE: usize = 8192;

fn expectation() -> ChannelExpectation {
    ChannelExpectation {
        name: "itest",
        channel_type: TEST_TYPE,
        min_size: 4096,
        version: 1,
        signature: VISOR_CHANNEL_SIGNATURE,
    }
}

/// Server side: header, two queues back to back with their slots after them.
fn create_server(path: &std::path::Path) -> Channel {
    let region = SharedRegion::create(path, CHANNEL_SIZE).unwrap();
    let header = ChannelHeader::new(TEST_TYPE, CHANNEL_SIZE as u64, 1, CHANNEL_HEADER_SIZE as u64);
    let channel = Channel::create(region, "itest", &header, Arc::new(RecordingDiagnostics::new())).unwrap();

    let slots_start = CHANNEL_HEADER_SIZE + QUEUES as usize * SIGNAL_QUEUE_HEADER_SIZE;
    for q in 0..QUEUES {
        let offset = channel.queue_offset(q).unwrap();
        let slots = slots_start + (q * SIGNAL_SIZE * MAX_SLOTS) as usize;
        init_queue(
            channel.region(),
            offset,
            &SignalQueueHeader::new(q, SIGNAL_SIZE, MAX_SLOTS, (slots - offset) as u64),
        )
        .unwrap();
    }
    channel.mark_ready().unwrap();
    channel
}

fn signal(n: u64) -> [u8; SIGNAL_SIZE as usize] {
    let mut s = [0u8; SIGNAL_SIZE as usize];
    s[..8].copy_from_slice(&n.to_le_bytes());
    s[8..16].copy_from_slice(&(!n).to_le_bytes());
    s
}

/// Attach from a second mapping of the same file and see state from both sides.
#[test]
fn test_attach_across_mappings() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("attach.chan");
    let server = create_server(&path);

    assert_eq!(server.current_state().unwrap().client, ClientState::Detached);

    let client = Channel::attach(
        SharedRegion::open(&path).unwrap(),
        &expectation(),
        Arc::new(RecordingDiagnostics::new()),
    )
    .unwrap();

    // Both mappings agree on the attachment
    let seen_by_server = server.current_state().unwrap();
    assert_eq!(seen_by_server.server, ServerState::Ready);
    assert_eq!(seen_by_server.client, ClientState::Attached);
    assert_eq!(client.current_state().unwrap(), seen_by_server);
}

/// A channel built for a newer version is refused, and the diagnostic sink
/// hears about it.
#[test]
fn test_attach_rejects_version_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("version.chan");
    let _server = create_server(&path);

    let diag = Arc::new(RecordingDiagnostics::new());
    let mut expected = expectation();
    expected.version = 2;
    let err = Channel::attach(SharedRegion::open(&path).unwrap(), &expected, diag.clone())
        .err()
        .unwrap();

    assert!(matches!(err, ChannelError::Validation(_)));
    assert_eq!(diag.count_event(visorbus::diag::event::VALIDATION_FAILED), 1);
}

/// Exactly max_slots - 1 signals fit; the next is rejected without
/// touching the stored ones.
#[test]
fn test_capacity_and_overflow_accounting() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("capacity.chan");
    let server = create_server(&path);

    for n in 0..(MAX_SLOTS - 1) as u64 {
        server.send(0, &signal(n)).unwrap();
    }
    for _ in 0..3 {
        let err = server.send(0, &signal(999)).unwrap_err();
        assert!(matches!(err, ChannelError::QueueFull));
    }

    let queue = server.signal_queue(0, SIGNAL_SIZE).unwrap();
    let stats = queue.stats().unwrap();
    assert_eq!(stats.num_sent, 15);
    assert_eq!(stats.num_overflows, 3);

    for n in 0..(MAX_SLOTS - 1) as u64 {
        let got = server.try_receive(0, SIGNAL_SIZE).unwrap().unwrap();
        assert_eq!(got, signal(n));
    }
    assert!(server.try_receive(0, SIGNAL_SIZE).unwrap().is_none());
}

/// Producer and consumer on separate mappings and threads, many wraps of
/// the ring: nothing lost, nothing duplicated, order kept.
#[test]
fn test_producer_consumer_threads() {
    const COUNT: u64 = 20_000;

    let dir = tempdir().unwrap();
    let path = dir.path().join("spsc.chan");
    let server = create_server(&path);
    let client = Channel::attach(
        SharedRegion::open(&path).unwrap(),
        &expectation(),
        Arc::new(RecordingDiagnostics::new()),
    )
    .unwrap();

    let producer = thread::spawn(move || {
        let mut overflows = 0u64;
        for n in 0..COUNT {
            loop {
                match server.send(0, &signal(n)) {
                    Ok(()) => break,
                    Err(ChannelError::QueueFull) => {
                        overflows += 1;
                        thread::yield_now();
                    }
                    Err(e) => panic!("send failed: {e}"),
                }
            }
        }
        overflows
    });

    let consumer = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut expected = 0u64;
        while expected < COUNT {
            match client.try_receive(0, SIGNAL_SIZE).unwrap() {
                Some(got) => {
                    assert_eq!(got, signal(expected), "out of order at {expected}");
                    expected += 1;
                }
                None => {
                    assert!(Instant::now() < deadline, "consumer stalled at {expected}");
                    thread::yield_now();
                }
            }
        }
        client
    });

    let overflows = producer.join().unwrap();
    let client = consumer.join().unwrap();

    let stats = client.signal_queue(0, SIGNAL_SIZE).unwrap().stats().unwrap();
    assert_eq!(stats.num_sent, COUNT);
    assert_eq!(stats.num_received, COUNT);
    assert_eq!(stats.num_overflows, overflows);
    assert_eq!(stats.head, stats.tail);
}

/// Queues of one channel are independent: filling one does not affect the other.
#[test]
fn test_queues_are_independent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("independent.chan");
    let server = create_server(&path);

    for n in 0..(MAX_SLOTS - 1) as u64 {
        server.send(0, &signal(n)).unwrap();
    }
    server.send(1, &signal(42)).unwrap();

    assert_eq!(server.try_receive(1, SIGNAL_SIZE).unwrap().unwrap(), signal(42));
    assert_eq!(server.try_receive(0, SIGNAL_SIZE).unwrap().unwrap(), signal(0));
}

/// A client refuses to touch queues once the server is torn down.
#[test]
fn test_client_stops_when_server_not_ready() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("teardown.chan");
    let server = create_server(&path);
    let client = Channel::attach(
        SharedRegion::open(&path).unwrap(),
        &expectation(),
        Arc::new(RecordingDiagnostics::new()),
    )
    .unwrap();

    server.send(0, &signal(1)).unwrap();
    server.mark_uninitialized().unwrap();

    assert!(matches!(
        client.try_receive(0, SIGNAL_SIZE),
        Err(ChannelError::ServerNotReady)
    ));
}
