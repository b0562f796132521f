//! Channel syscalls: pair creation, conversations, atomic send, receive,
//! and close.
//!
//! The send path is validate-then-commit: every attachment is translated
//! from the caller's descriptor space into kernel references before the
//! target's send lock is taken, and nothing is enqueued or uninstalled
//! until the commit succeeds. A failed send leaves every caller descriptor
//! installed and every referent untouched.

use crate::error::Kind;
use crate::ipc::channel::Channel;
use crate::ipc::message::{Attachment, Data, Message, MessagePreview};
use crate::memory::mapping::Mapping;
use crate::syscall::wire::{self, Record};
use crate::syscall::{Invocation, MessageSizes, ReceiveFlags, SendFlags, SysError, SysResult};
use crate::task::process::{Descriptor, Process};
use crate::task::scheduler;
use crate::task::thread::WakeReason;
use crate::time::Timeout;
use std::sync::Arc;

/// A send request: conversation ID, body bytes, and the attachments region
/// in wire format.
pub struct SendMessage<'a> {
    pub conversation_id: u64,
    pub body: &'a [u8],
    pub attachments: &'a [u8],
}

/// Caller-provided buffers a receive fills.
pub struct ReceiveBuffers<'a> {
    pub body: &'a mut [u8],
    pub attachments: &'a mut [u8],
}

/// Completed receive (or peek): identifiers plus the byte lengths written.
/// For a peek, the lengths are those the caller's buffers must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveResult {
    pub conversation_id: u64,
    pub message_id: u64,
    pub body_len: usize,
    pub attachments_len: usize,
}

/// Create a channel pair and install both endpoints in the caller's
/// descriptor table. Returns the two descriptor IDs.
pub fn channel_create_pair(proc: &Process) -> SysResult<[u64; 2]> {
    let (a, b) = Channel::pair();
    let da = proc.install(Descriptor::Channel(a));
    let db = proc.install(Descriptor::Channel(b));
    log::debug!("[sys] pid {} channel pair ({}, {})", proc.pid(), da, db);
    Ok([da, db])
}

/// As [`channel_create_pair`] with an explicit queue bound per endpoint.
pub fn channel_create_pair_with_limit(proc: &Process, limit: usize) -> SysResult<[u64; 2]> {
    if limit == 0 {
        return Err(Kind::InvalidArgument.into());
    }
    let (a, b) = Channel::pair_with_limit(limit);
    let da = proc.install(Descriptor::Channel(a));
    let db = proc.install(Descriptor::Channel(b));
    Ok([da, db])
}

/// Allocate a fresh conversation ID on a channel.
pub fn channel_conversation_create(proc: &Process, desc: u64) -> SysResult<u64> {
    let channel = proc.lookup_channel(desc)?;
    Ok(channel.conversation_create())
}

/// Close a channel endpoint; optionally uninstall its descriptor too.
pub fn channel_close(proc: &Process, desc: u64, release_descriptor: bool) -> SysResult<()> {
    let channel = proc.lookup_channel(desc)?;
    channel.close();
    if release_descriptor {
        proc.uninstall(desc)?;
    }
    Ok(())
}

/// Create a shared memory mapping descriptor.
pub fn mapping_create(proc: &Process, page_count: usize) -> SysResult<u64> {
    let mapping = Mapping::new(page_count)?;
    Ok(proc.install(Descriptor::Mapping(mapping)))
}

/// Drop a mapping descriptor.
pub fn mapping_close(proc: &Process, desc: u64) -> SysResult<()> {
    proc.lookup_mapping(desc)?;
    proc.uninstall(desc)?;
    Ok(())
}

/// One attachment translated into kernel references, plus the descriptor to
/// uninstall after a successful transfer.
struct Translated {
    attachment: Attachment,
    transfer_descriptor: Option<u64>,
}

/// Validate and translate the attachments region against the caller's
/// descriptor table. No state changes; any failure leaves everything
/// installed.
fn translate_attachments(
    proc: &Process,
    sender: &Arc<Channel>,
    region: &[u8],
) -> SysResult<Vec<Translated>> {
    let records = wire::decode(region)?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let translated = match record {
            Record::Null => Translated { attachment: Attachment::Null, transfer_descriptor: None },
            Record::Channel { descriptor } => {
                let endpoint = proc.lookup_channel(descriptor)?;
                if Arc::ptr_eq(&endpoint, sender) {
                    // A channel cannot carry itself.
                    return Err(Kind::InvalidArgument.into());
                }
                if proc.channel_descriptor_count(&endpoint) != 1 {
                    // Transfer requires sole ownership.
                    return Err(Kind::InvalidArgument.into());
                }
                Translated {
                    attachment: Attachment::Channel(endpoint),
                    transfer_descriptor: Some(descriptor),
                }
            }
            Record::Mapping { descriptor } => Translated {
                attachment: Attachment::Mapping(proc.lookup_mapping(descriptor)?),
                transfer_descriptor: None,
            },
            Record::Data { shared: true, len, target } => {
                let mapping = proc.lookup_mapping(target)?;
                if len as usize > mapping.len() {
                    return Err(Kind::InvalidArgument.into());
                }
                Translated {
                    attachment: Attachment::Data(Data::Shared(mapping)),
                    transfer_descriptor: None,
                }
            }
            Record::Data { shared: false, len, target } => {
                let start = target as usize;
                let end = start
                    .checked_add(len as usize)
                    .ok_or(Kind::InvalidArgument)?;
                let bytes = region.get(start..end).ok_or(Kind::InvalidArgument)?;
                Translated {
                    attachment: Attachment::Data(Data::Copied(bytes.to_vec())),
                    transfer_descriptor: None,
                }
            }
        };
        out.push(translated);
    }
    Ok(out)
}

/// Send a message on a channel.
///
/// Atomic: on any failure, no attachment is detached and no descriptor is
/// uninstalled. On success the caller's descriptors for transferred channel
/// endpoints are uninstalled and the message ID is returned. A full queue
/// without `NO_WAIT` parks the caller on the target's queue-full queue;
/// re-enter after the thread resumes.
pub fn channel_send(
    proc: &Process,
    desc: u64,
    flags: SendFlags,
    timeout: Option<Timeout>,
    msg: &SendMessage<'_>,
) -> Invocation<u64> {
    // A previous park may have ended this syscall already.
    if let Some(tid) = scheduler::current() {
        match scheduler::take_wake_reason(tid) {
            Some(WakeReason::TimedOut) => {
                return Invocation::Complete(Err(Kind::TimedOut.into()));
            }
            Some(WakeReason::Interrupted) => {
                let _ = scheduler::consume_interrupt_marker(tid);
                return Invocation::Complete(Err(Kind::Interrupted.into()));
            }
            _ => {}
        }
    }

    let result = (|| -> SysResult<(Arc<Channel>, Vec<Translated>)> {
        let channel = proc.lookup_channel(desc)?;
        let translated = translate_attachments(proc, &channel, msg.attachments)?;
        Ok((channel, translated))
    })();
    let (channel, translated) = match result {
        Ok(v) => v,
        Err(e) => return Invocation::Complete(Err(e)),
    };

    let mut message = Message::new(msg.body.to_vec());
    message.conversation_id = msg.conversation_id;
    let mut transfers = Vec::new();
    for t in translated {
        if let Some(d) = t.transfer_descriptor {
            transfers.push(d);
        }
        message.attachments.push(t.attachment);
    }

    match channel.send(message, flags.contains(SendFlags::START_CONVERSATION)) {
        Ok(message_id) => {
            // Commit done: uninstall the transferred endpoints' descriptors.
            for d in transfers {
                let _ = proc.uninstall(d);
            }
            Invocation::Complete(Ok(message_id))
        }
        Err((Kind::ResourceUnavailable, _message)) => {
            if flags.contains(SendFlags::NO_WAIT) {
                return Invocation::Complete(Err(Kind::ResourceUnavailable.into()));
            }
            // Dropping `_message` releases the translated references; the
            // retry after wakeup translates afresh.
            let Some(target) = channel.peer() else {
                return Invocation::Complete(Err(Kind::PermanentOutage.into()));
            };
            match scheduler::park_current(target.full_wq(), timeout, false) {
                Ok(()) => Invocation::Parked,
                Err(kind) => Invocation::Complete(Err(kind.into())),
            }
        }
        Err((kind, _message)) => Invocation::Complete(Err(kind.into())),
    }
}

/// Buffer sizes a message needs on receive.
fn required_sizes(preview: &MessagePreview) -> MessageSizes {
    let mut chain = 0usize;
    let mut payload = 0usize;
    for a in &preview.attachments {
        chain += match a.type_tag {
            wire::ATTACHMENT_TYPE_NULL => wire::NULL_RECORD_LEN,
            wire::ATTACHMENT_TYPE_CHANNEL => wire::CHANNEL_RECORD_LEN,
            wire::ATTACHMENT_TYPE_MAPPING => wire::MAPPING_RECORD_LEN,
            _ => wire::DATA_RECORD_LEN,
        };
        if a.type_tag == wire::ATTACHMENT_TYPE_DATA && !a.shared {
            payload += a.data_len;
        }
    }
    MessageSizes { body: preview.body_len, attachments: chain + payload }
}

/// Receive a message from a channel into the caller's buffers.
///
/// `PRE_RECEIVE_PEEK` reports the head message's identifiers and required
/// buffer sizes without consuming it. Undersized buffers report `too_big`
/// with the required sizes, also without consuming. An empty queue parks
/// the caller (unless `NO_WAIT`); a drained queue whose peer is closed
/// reports `permanent_outage`.
pub fn channel_receive(
    proc: &Process,
    desc: u64,
    flags: ReceiveFlags,
    timeout: Option<Timeout>,
    match_message_id: u64,
    bufs: &mut ReceiveBuffers<'_>,
) -> Invocation<ReceiveResult> {
    if let Some(tid) = scheduler::current() {
        match scheduler::take_wake_reason(tid) {
            Some(WakeReason::TimedOut) => {
                return Invocation::Complete(Err(Kind::TimedOut.into()));
            }
            Some(WakeReason::Interrupted) => {
                let _ = scheduler::consume_interrupt_marker(tid);
                return Invocation::Complete(Err(Kind::Interrupted.into()));
            }
            _ => {}
        }
    }

    if flags.contains(ReceiveFlags::MATCH_MESSAGE_ID) && !flags.contains(ReceiveFlags::NO_WAIT) {
        return Invocation::Complete(Err(Kind::InvalidArgument.into()));
    }

    let channel = match proc.lookup_channel(desc) {
        Ok(ch) => ch,
        Err(kind) => return Invocation::Complete(Err(kind.into())),
    };

    let preview = match channel.peek() {
        Ok(p) => p,
        Err(Kind::ResourceUnavailable) => {
            if flags.contains(ReceiveFlags::NO_WAIT) {
                return Invocation::Complete(Err(Kind::ResourceUnavailable.into()));
            }
            let interruptible = flags.contains(ReceiveFlags::INTERRUPTIBLE);
            return match scheduler::park_current(channel.arrival_wq(), timeout, interruptible) {
                Ok(()) => Invocation::Parked,
                Err(kind) => Invocation::Complete(Err(kind.into())),
            };
        }
        Err(kind) => return Invocation::Complete(Err(kind.into())),
    };

    let required = required_sizes(&preview);
    if flags.contains(ReceiveFlags::PRE_RECEIVE_PEEK) {
        return Invocation::Complete(Ok(ReceiveResult {
            conversation_id: preview.conversation_id,
            message_id: preview.message_id,
            body_len: required.body,
            attachments_len: required.attachments,
        }));
    }
    if required.body > bufs.body.len() || required.attachments > bufs.attachments.len() {
        return Invocation::Complete(Err(SysError::too_big(required)));
    }

    let wanted = flags
        .contains(ReceiveFlags::MATCH_MESSAGE_ID)
        .then_some(match_message_id);
    let message = match channel.receive(wanted) {
        Ok(m) => m,
        Err(kind) => return Invocation::Complete(Err(kind.into())),
    };

    // Deliver: install descriptors for carried objects and lay the region
    // out as records followed by copied payload bytes.
    bufs.body[..message.body.len()].copy_from_slice(&message.body);

    let mut records = Vec::with_capacity(message.attachments.len());
    let chain_len: usize = message
        .attachments
        .iter()
        .map(|a| match a {
            Attachment::Null => wire::NULL_RECORD_LEN,
            Attachment::Channel(_) => wire::CHANNEL_RECORD_LEN,
            Attachment::Mapping(_) => wire::MAPPING_RECORD_LEN,
            Attachment::Data(_) => wire::DATA_RECORD_LEN,
        })
        .sum();
    let mut payload_at = chain_len;
    let mut payloads: Vec<(usize, Vec<u8>)> = Vec::new();
    for attachment in message.attachments {
        let record = match attachment {
            Attachment::Null => Record::Null,
            Attachment::Channel(endpoint) => {
                let d = proc.install(Descriptor::Channel(endpoint));
                Record::Channel { descriptor: d }
            }
            Attachment::Mapping(mapping) => {
                let d = proc.install(Descriptor::Mapping(mapping));
                Record::Mapping { descriptor: d }
            }
            Attachment::Data(Data::Shared(mapping)) => {
                let len = mapping.len() as u64;
                let d = proc.install(Descriptor::Mapping(mapping));
                Record::Data { shared: true, len, target: d }
            }
            Attachment::Data(Data::Copied(bytes)) => {
                let record = Record::Data {
                    shared: false,
                    len: bytes.len() as u64,
                    target: payload_at as u64,
                };
                payload_at += bytes.len();
                payloads.push((payload_at - bytes.len(), bytes));
                record
            }
        };
        records.push(record);
    }
    if wire::encode(bufs.attachments, &records).is_err() {
        // Sizes were checked against the preview; reaching this is a
        // bookkeeping bug, not a runtime condition.
        panic!("attachment region sized by peek is too small");
    }
    for (at, bytes) in payloads {
        bufs.attachments[at..at + bytes.len()].copy_from_slice(&bytes);
    }

    Invocation::Complete(Ok(ReceiveResult {
        conversation_id: message.conversation_id,
        message_id: message.message_id,
        body_len: message.body.len(),
        attachments_len: payload_at,
    }))
}
