//! Channel messages and their typed attachments.
//!
//! A message is owned by exactly one party at any moment: the sender before
//! send, the peer's queue in transit, the receiver afterwards. Each
//! attachment in a queued message owns exactly one reference on its
//! referent; delivery hands that reference to the receiver.

use crate::ipc::channel::Channel;
use crate::memory::mapping::Mapping;
use std::sync::Arc;

/// The data payload of a data attachment.
#[derive(Debug)]
pub enum Data {
    /// Backed by a shared mapping; the attachment holds one reference and
    /// the receiver reads through the mapping.
    Shared(Arc<Mapping>),
    /// Kernel-copied bytes; the receiver copies them out at receive time.
    Copied(Vec<u8>),
}

impl Data {
    pub fn len(&self) -> usize {
        match self {
            Data::Shared(mapping) => mapping.len(),
            Data::Copied(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One typed element carried alongside a message body.
#[derive(Debug)]
pub enum Attachment {
    /// Placeholder preserving the attachment's index.
    Null,
    /// A transferred channel endpoint; ownership moves to the receiver.
    Channel(Arc<Channel>),
    /// A shared memory mapping; the message holds an extra reference.
    Mapping(Arc<Mapping>),
    /// Data, shared or copied.
    Data(Data),
}

impl Attachment {
    /// Wire-format type tag for this attachment.
    pub fn type_tag(&self) -> u8 {
        match self {
            Attachment::Null => 1,
            Attachment::Channel(_) => 2,
            Attachment::Mapping(_) => 3,
            Attachment::Data(_) => 4,
        }
    }
}

/// A channel message: conversation and message identifiers, body bytes, and
/// an ordered attachment list.
#[derive(Debug)]
pub struct Message {
    /// Groups related messages; `0` means no conversation.
    pub conversation_id: u64,
    /// Assigned by the kernel when the send commits; `0` before that.
    pub message_id: u64,
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Message {
            conversation_id: 0,
            message_id: 0,
            body,
            attachments: Vec::new(),
        }
    }
}

/// Size and type information about a queued message, exposed by peek so a
/// receiver can size its buffers without consuming anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePreview {
    pub conversation_id: u64,
    pub message_id: u64,
    pub body_len: usize,
    pub attachments: Vec<AttachmentDesc>,
}

/// Peek-visible description of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub type_tag: u8,
    /// Byte length for data attachments; zero otherwise.
    pub data_len: usize,
    /// True for shared data attachments.
    pub shared: bool,
}

impl Message {
    /// Build the peek description of this message.
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            conversation_id: self.conversation_id,
            message_id: self.message_id,
            body_len: self.body.len(),
            attachments: self
                .attachments
                .iter()
                .map(|a| AttachmentDesc {
                    type_tag: a.type_tag(),
                    data_len: match a {
                        Attachment::Data(d) => d.len(),
                        _ => 0,
                    },
                    shared: matches!(a, Attachment::Data(Data::Shared(_))),
                })
                .collect(),
        }
    }
}
