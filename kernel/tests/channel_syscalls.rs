//! End-to-end channel syscall tests: the wire format, descriptor
//! translation, atomic send, blocking, and close semantics.

use anillo_kernel::error::Kind;
use anillo_kernel::syscall::handlers::channel::{
    channel_close, channel_conversation_create, channel_create_pair,
    channel_create_pair_with_limit, channel_receive, channel_send, mapping_create,
    ReceiveBuffers, ReceiveResult, SendMessage,
};
use anillo_kernel::syscall::wire::{self, Record};
use anillo_kernel::syscall::{ReceiveFlags, SendFlags, SysResult};
use anillo_kernel::task::process::Process;
use anillo_kernel::task::scheduler;
use anillo_kernel::task::thread::CreateFlags;
use anillo_kernel::time::{self, Timeout};
use std::sync::{Mutex, MutexGuard, OnceLock};

static KERNEL_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialize tests around the kernel singletons and start clean.
fn kernel_test() -> MutexGuard<'static, ()> {
    let guard = KERNEL_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    anillo_kernel::reset();
    anillo_kernel::init();
    guard
}

/// Spawn a userspace thread and make it the current one, so blocking
/// syscalls have a thread to park.
fn current_thread() -> u64 {
    let tid = scheduler::spawn(0x4000, 0, None, 0, CreateFlags::USERSPACE.bits()).unwrap();
    scheduler::resume(tid).unwrap();
    assert_eq!(scheduler::schedule(), Some(tid));
    tid
}

/// Build an attachments region: the record chain followed by copied-data
/// payloads. Copied records carry region offsets assigned here.
fn build_region(records: &[Record], payloads: &[&[u8]]) -> Vec<u8> {
    let chain_len: usize = records.iter().map(wire::record_len).sum();
    let payload_len: usize = payloads.iter().map(|p| p.len()).sum();
    let mut fixed = Vec::from(records);
    let mut at = chain_len;
    let mut payload_iter = payloads.iter();
    for record in fixed.iter_mut() {
        if let Record::Data { shared: false, len, target } = record {
            let payload = payload_iter.next().expect("payload for copied record");
            assert_eq!(payload.len() as u64, *len);
            *target = at as u64;
            at += payload.len();
        }
    }
    let mut region = vec![0u8; chain_len + payload_len];
    wire::encode(&mut region, &fixed).unwrap();
    let mut at = chain_len;
    for payload in payloads {
        region[at..at + payload.len()].copy_from_slice(payload);
        at += payload.len();
    }
    region
}

fn send_simple(proc: &Process, desc: u64, body: &[u8], attachments: &[u8]) -> SysResult<u64> {
    channel_send(
        proc,
        desc,
        SendFlags::NO_WAIT,
        None,
        &SendMessage { conversation_id: 0, body, attachments },
    )
    .expect_complete()
}

fn receive_simple(
    proc: &Process,
    desc: u64,
    body: &mut [u8],
    attachments: &mut [u8],
) -> SysResult<ReceiveResult> {
    channel_receive(
        proc,
        desc,
        ReceiveFlags::NO_WAIT,
        None,
        0,
        &mut ReceiveBuffers { body, attachments },
    )
    .expect_complete()
}

#[test]
fn test_channel_echo() {
    // Create a pair, send "ping" with one null attachment, receive it back,
    // close the sender, and observe permanent outage on the next receive.
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();

    let region = build_region(&[Record::Null], &[]);
    send_simple(&proc, a, b"ping", &region).unwrap();

    let mut body = [0u8; 16];
    let mut attachments = vec![0u8; 64];
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    assert_eq!(&body[..r.body_len], b"ping");
    assert_eq!(r.conversation_id, 0);
    let records = wire::decode(&attachments[..r.attachments_len]).unwrap();
    assert_eq!(records, vec![Record::Null]);

    channel_close(&proc, a, false).unwrap();
    let err = receive_simple(&proc, b, &mut body, &mut attachments).err().unwrap();
    assert_eq!(err.kind, Kind::PermanentOutage);
}

#[test]
fn test_channel_transfer() {
    // Send endpoint C of a second pair across the first pair; the received
    // endpoint must be a working peer of D.
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();
    let [c, d] = channel_create_pair(&proc).unwrap();

    let region = build_region(&[Record::Channel { descriptor: c }], &[]);
    send_simple(&proc, a, b"", &region).unwrap();
    assert!(
        proc.lookup_channel(c).is_err(),
        "transferred descriptor uninstalled after commit"
    );

    let mut body = [0u8; 4];
    let mut attachments = vec![0u8; 64];
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    let records = wire::decode(&attachments[..r.attachments_len]).unwrap();
    let Record::Channel { descriptor: received } = records[0] else {
        panic!("expected a channel attachment, got {:?}", records[0]);
    };

    // The received endpoint speaks to D.
    send_simple(&proc, received, b"hi", &build_region(&[], &[])).unwrap();
    let r = receive_simple(&proc, d, &mut body, &mut attachments).unwrap();
    assert_eq!(&body[..r.body_len], b"hi");
}

#[test]
fn test_send_transfer_requires_sole_ownership() {
    let _k = kernel_test();
    let proc = Process::new();
    let [a, _b] = channel_create_pair(&proc).unwrap();
    let [c, _d] = channel_create_pair(&proc).unwrap();

    // A second descriptor for C makes the transfer ambiguous.
    let endpoint = proc.lookup_channel(c).unwrap();
    let extra = proc.install(anillo_kernel::task::process::Descriptor::Channel(endpoint));

    let before = proc.descriptor_count();
    let region = build_region(&[Record::Channel { descriptor: c }], &[]);
    let err = send_simple(&proc, a, b"", &region).err().unwrap();
    assert_eq!(err.kind, Kind::InvalidArgument);
    assert_eq!(proc.descriptor_count(), before, "no descriptor uninstalled");
    assert!(proc.lookup_channel(c).is_ok());
    assert!(proc.lookup_channel(extra).is_ok());
}

#[test]
fn test_send_failure_is_atomic() {
    // One bad attachment poisons the whole send: nothing is enqueued and
    // every installed descriptor survives.
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();
    let [c, _d] = channel_create_pair(&proc).unwrap();

    let region = build_region(
        &[
            Record::Channel { descriptor: c },
            Record::Mapping { descriptor: 0xDEAD },
        ],
        &[],
    );
    let err = send_simple(&proc, a, b"body", &region).err().unwrap();
    assert_eq!(err.kind, Kind::NoSuchResource);
    assert!(proc.lookup_channel(c).is_ok(), "transfer candidate still installed");

    let mut body = [0u8; 8];
    let mut attachments = [0u8; 8];
    let err = receive_simple(&proc, b, &mut body, &mut attachments).err().unwrap();
    assert_eq!(err.kind, Kind::ResourceUnavailable, "nothing was enqueued");
}

#[test]
fn test_conversation_ids() {
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();

    let c1 = channel_conversation_create(&proc, a).unwrap();
    let c2 = channel_conversation_create(&proc, a).unwrap();
    assert!(c1 > 0 && c2 > c1, "monotonic, never zero");

    // An explicitly stamped conversation survives the round trip.
    channel_send(
        &proc,
        a,
        SendFlags::NO_WAIT,
        None,
        &SendMessage { conversation_id: c1, body: b"", attachments: &[] },
    )
    .expect_complete()
    .unwrap();
    let mut body = [0u8; 1];
    let mut attachments = [0u8; 1];
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    assert_eq!(r.conversation_id, c1);

    // start-conversation allocates a fresh one past the explicit allocations.
    channel_send(
        &proc,
        a,
        SendFlags::NO_WAIT | SendFlags::START_CONVERSATION,
        None,
        &SendMessage { conversation_id: 0, body: b"", attachments: &[] },
    )
    .expect_complete()
    .unwrap();
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    assert!(r.conversation_id > c2);
}

#[test]
fn test_data_attachments_round_trip() {
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();

    // One copied payload and one shared mapping payload.
    let mapping_desc = mapping_create(&proc, 1).unwrap();
    let mapping = proc.lookup_mapping(mapping_desc).unwrap();
    mapping.write(0, b"shared bytes").unwrap();

    let region = build_region(
        &[
            Record::Data { shared: false, len: 6, target: 0 },
            Record::Data { shared: true, len: 4096, target: mapping_desc },
        ],
        &[b"copied"],
    );
    send_simple(&proc, a, b"", &region).unwrap();
    assert!(
        proc.lookup_mapping(mapping_desc).is_ok(),
        "shared data keeps the caller's descriptor"
    );

    let mut body = [0u8; 1];
    let mut attachments = vec![0u8; 256];
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    let records = wire::decode(&attachments[..r.attachments_len]).unwrap();

    let Record::Data { shared: false, len, target } = records[0] else {
        panic!("expected copied data first");
    };
    let at = target as usize;
    assert_eq!(&attachments[at..at + len as usize], b"copied");

    let Record::Data { shared: true, target: received_desc, .. } = records[1] else {
        panic!("expected shared data second");
    };
    let received = proc.lookup_mapping(received_desc).unwrap();
    let mut buf = [0u8; 12];
    received.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared bytes");
}

#[test]
fn test_receive_too_big_reports_required_sizes() {
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();

    let region = build_region(&[Record::Data { shared: false, len: 6, target: 0 }], &[b"copied"]);
    send_simple(&proc, a, b"ping", &region).unwrap();

    let mut body = [0u8; 1];
    let mut attachments = [0u8; 1];
    let err = receive_simple(&proc, b, &mut body, &mut attachments).err().unwrap();
    assert_eq!(err.kind, Kind::TooBig);
    let required = err.required.unwrap();
    assert_eq!(required.body, 4);
    assert_eq!(required.attachments, wire::DATA_RECORD_LEN + 6);

    // Nothing was consumed; a right-sized receive succeeds.
    let mut body = vec![0u8; required.body];
    let mut attachments = vec![0u8; required.attachments];
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    assert_eq!(&body[..r.body_len], b"ping");
}

#[test]
fn test_peek_sizes_without_consuming() {
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();
    let region = build_region(&[Record::Null], &[]);
    send_simple(&proc, a, b"ping", &region).unwrap();

    let mut body = [0u8; 0];
    let mut attachments = [0u8; 0];
    let r = channel_receive(
        &proc,
        b,
        ReceiveFlags::NO_WAIT | ReceiveFlags::PRE_RECEIVE_PEEK,
        None,
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    )
    .expect_complete()
    .unwrap();
    assert_eq!(r.body_len, 4);
    assert_eq!(r.attachments_len, wire::NULL_RECORD_LEN);

    let mut body = [0u8; 4];
    let mut attachments = [0u8; wire::NULL_RECORD_LEN];
    receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
}

#[test]
fn test_match_message_id_requires_no_wait() {
    let _k = kernel_test();
    let proc = Process::new();
    let [_a, b] = channel_create_pair(&proc).unwrap();
    let mut body = [0u8; 1];
    let mut attachments = [0u8; 1];
    let err = channel_receive(
        &proc,
        b,
        ReceiveFlags::MATCH_MESSAGE_ID,
        None,
        1,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    )
    .expect_complete()
    .err()
    .unwrap();
    assert_eq!(err.kind, Kind::InvalidArgument);
}

#[test]
fn test_blocking_send_backpressure() {
    let _k = kernel_test();
    let proc = Process::new();
    let sender = current_thread();
    let [a, b] = channel_create_pair_with_limit(&proc, 1).unwrap();

    send_simple(&proc, a, b"first", &[]).unwrap();

    // Queue full: the sender parks on the target's queue-full queue.
    let msg = SendMessage { conversation_id: 0, body: b"second", attachments: &[] };
    let step = channel_send(&proc, a, SendFlags::empty(), None, &msg);
    assert!(step.is_parked());
    assert_eq!(scheduler::current(), None);

    // A receive frees space and wakes the sender.
    let mut body = [0u8; 8];
    let mut attachments = [0u8; 8];
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    assert_eq!(&body[..r.body_len], b"first");
    assert_eq!(scheduler::schedule(), Some(sender));

    // Re-entering completes the send; FIFO order is preserved.
    channel_send(&proc, a, SendFlags::empty(), None, &msg)
        .expect_complete()
        .unwrap();
    let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
    assert_eq!(&body[..r.body_len], b"second");
}

#[test]
fn test_blocking_send_aborted_by_close() {
    let _k = kernel_test();
    let proc = Process::new();
    let sender = current_thread();
    let [a, _b] = channel_create_pair_with_limit(&proc, 1).unwrap();

    send_simple(&proc, a, b"fill", &[]).unwrap();
    let msg = SendMessage { conversation_id: 0, body: b"stuck", attachments: &[] };
    assert!(channel_send(&proc, a, SendFlags::empty(), None, &msg).is_parked());

    // Closing the sending endpoint aborts its pending send.
    channel_close(&proc, a, false).unwrap();
    assert_eq!(scheduler::schedule(), Some(sender));
    let err = channel_send(&proc, a, SendFlags::empty(), None, &msg)
        .expect_complete()
        .err()
        .unwrap();
    assert_eq!(err.kind, Kind::PermanentOutage);
}

#[test]
fn test_blocking_receive_completes_on_send() {
    let _k = kernel_test();
    let proc = Process::new();
    let receiver = current_thread();
    let [a, b] = channel_create_pair(&proc).unwrap();

    let mut body = [0u8; 8];
    let mut attachments = [0u8; 8];
    let step = channel_receive(
        &proc,
        b,
        ReceiveFlags::empty(),
        None,
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    );
    assert!(step.is_parked());

    send_simple(&proc, a, b"wake", &[]).unwrap();
    assert_eq!(scheduler::schedule(), Some(receiver));

    let r = channel_receive(
        &proc,
        b,
        ReceiveFlags::empty(),
        None,
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    )
    .expect_complete()
    .unwrap();
    assert_eq!(&body[..r.body_len], b"wake");
}

#[test]
fn test_blocking_receive_times_out() {
    let _k = kernel_test();
    let proc = Process::new();
    let receiver = current_thread();
    let [_a, b] = channel_create_pair(&proc).unwrap();

    let mut body = [0u8; 8];
    let mut attachments = [0u8; 8];
    let step = channel_receive(
        &proc,
        b,
        ReceiveFlags::empty(),
        Some(Timeout::relative(1_000)),
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    );
    assert!(step.is_parked());

    time::advance(1_000);
    assert_eq!(scheduler::schedule(), Some(receiver));
    let err = channel_receive(
        &proc,
        b,
        ReceiveFlags::empty(),
        None,
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    )
    .expect_complete()
    .err()
    .unwrap();
    assert_eq!(err.kind, Kind::TimedOut);
}

#[test]
fn test_blocking_receive_interrupted_by_signal() {
    let _k = kernel_test();
    let proc = Process::new();
    let receiver = current_thread();
    scheduler::signal_configure(
        receiver,
        2,
        Some(anillo_kernel::ipc::signal::SignalConfiguration {
            handler: 0x5000,
            context: 0,
            flags: anillo_kernel::ipc::signal::SignalFlags::ENABLED,
        }),
    )
    .unwrap();
    let [_a, b] = channel_create_pair(&proc).unwrap();

    let mut body = [0u8; 8];
    let mut attachments = [0u8; 8];
    let step = channel_receive(
        &proc,
        b,
        ReceiveFlags::INTERRUPTIBLE,
        None,
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    );
    assert!(step.is_parked());

    scheduler::signal_raise(receiver, 2).unwrap();
    assert_eq!(scheduler::schedule(), Some(receiver));
    let err = channel_receive(
        &proc,
        b,
        ReceiveFlags::INTERRUPTIBLE,
        None,
        0,
        &mut ReceiveBuffers { body: &mut body, attachments: &mut attachments },
    )
    .expect_complete()
    .err()
    .unwrap();
    assert_eq!(err.kind, Kind::Interrupted);

    // The signal itself is still pending and delivers at the user boundary.
    assert_eq!(
        anillo_kernel::syscall::handlers::thread::return_to_user(receiver).unwrap(),
        Some(2)
    );
}

#[test]
fn test_fifo_across_many_messages() {
    let _k = kernel_test();
    let proc = Process::new();
    let [a, b] = channel_create_pair(&proc).unwrap();
    for i in 0..10u8 {
        send_simple(&proc, a, &[i], &[]).unwrap();
    }
    for i in 0..10u8 {
        let mut body = [0u8; 1];
        let mut attachments = [0u8; 1];
        let r = receive_simple(&proc, b, &mut body, &mut attachments).unwrap();
        assert_eq!(body[..r.body_len], [i]);
    }
}
