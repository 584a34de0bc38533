use std::collections::VecDeque;

use crate::object::ObjectId;

/// Number of argument words carried by a message.
pub const MESSAGE_ARGS: usize = 4;
/// Size in bytes of a message as delivered into a server's receive buffer:
/// `id, function, args[4]`, each a little-endian u32.
pub const MESSAGE_WIRE_LEN: u32 = 4 * (2 + MESSAGE_ARGS as u32);

/// A client request travelling over a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Message {
    pub id: u32,
    pub server: ObjectId,
    pub session: ObjectId,
    /// Thread blocked in send-receive until the server completes the message.
    pub client: ObjectId,
    pub function: i32,
    pub args: [u32; MESSAGE_ARGS],
}

impl Message {
    pub(crate) fn to_wire(self) -> [u8; MESSAGE_WIRE_LEN as usize] {
        let mut out = [0u8; MESSAGE_WIRE_LEN as usize];
        let words = [self.id, self.function as u32]
            .into_iter()
            .chain(self.args);
        for (i, w) in words.enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Server {
    /// Thread that created the server; only it may receive.
    pub(crate) owner_thread: Option<ObjectId>,
    /// Delivered-later message ids, oldest first.
    pub(crate) queue: VecDeque<u32>,
    /// Server thread blocked in receive, with its buffer address.
    pub(crate) receiver: Option<(ObjectId, u32)>,
}

impl Server {
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    /// `None` once the server has been destroyed.
    pub(crate) server: Option<ObjectId>,
    /// Message currently awaiting completion.
    pub(crate) outstanding: Option<u32>,
}

impl Session {
    pub fn server(&self) -> Option<ObjectId> {
        self.server
    }

    pub fn outstanding(&self) -> Option<u32> {
        self.outstanding
    }
}
