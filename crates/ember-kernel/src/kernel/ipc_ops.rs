use tracing::{debug, trace};

use crate::error::codes::{KERR_BAD_DESCRIPTOR, KERR_CANCEL, KERR_DIED, KERR_NONE};
use crate::error::{KernelError, Result};
use crate::ipc::{Message, Server, Session, MESSAGE_ARGS};
use crate::object::{KernelObject, ObjectId, ObjectKind};
use crate::thread::WaitReason;

use super::{Kernel, WaitOutcome};

impl Kernel {
    /// Create a named server owned by `thread`'s process. Only `thread` may receive on it.
    pub fn create_server(&mut self, thread: ObjectId, name: &str) -> Result<ObjectId> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument("servers must be named"));
        }
        if self.objects.find_named(ObjectKind::Server, name).is_some() {
            return Err(KernelError::AlreadyExists {
                kind: ObjectKind::Server,
                name: name.to_string(),
            });
        }
        let process = self.objects.thread(thread)?.process;
        let server = Server {
            owner_thread: Some(thread),
            ..Server::default()
        };
        let id = self
            .objects
            .insert(name, Some(process), KernelObject::Server(server))?;
        debug!(server = id.0, name, "server created");
        Ok(id)
    }

    /// Open a session from `process` to the server called `name`.
    pub fn connect(&mut self, process: ObjectId, name: &str) -> Result<ObjectId> {
        self.objects.process(process)?;
        let server = self
            .objects
            .find_named(ObjectKind::Server, name)
            .ok_or_else(|| KernelError::NameNotFound {
                kind: ObjectKind::Server,
                name: name.to_string(),
            })?;
        let session = Session {
            server: Some(server),
            outstanding: None,
        };
        let id = self
            .objects
            .insert("", Some(process), KernelObject::Session(session))?;
        trace!(session = id.0, server = server.0, "session connected");
        Ok(id)
    }

    /// Send a message over `session` and block `thread` until the server completes it.
    pub fn send_receive(
        &mut self,
        thread: ObjectId,
        session: ObjectId,
        function: i32,
        args: [u32; MESSAGE_ARGS],
    ) -> Result<WaitOutcome> {
        let s = self.objects.session(session)?;
        if s.outstanding.is_some() {
            return Err(KernelError::InUse("session already has an outstanding message"));
        }
        let server = s.server.ok_or(KernelError::Died("server has gone"))?;
        let id = self.alloc_message_id()?;
        let msg = Message {
            id,
            server,
            session,
            client: thread,
            function,
            args,
        };
        self.messages.insert(id, msg);
        self.objects.session_mut(session)?.outstanding = Some(id);

        let srv = self.objects.server_mut(server)?;
        match srv.receiver.take() {
            Some((receiver, buffer)) => self.deliver(server, receiver, buffer, msg)?,
            None => srv.queue.push_back(id),
        }
        self.block(thread, WaitReason::Reply(session))?;
        trace!(message = id, session = session.0, function, "message sent");
        Ok(WaitOutcome::Blocked)
    }

    /// Hand `msg` to a server thread that was blocked in receive.
    fn deliver(
        &mut self,
        server: ObjectId,
        receiver: ObjectId,
        buffer: u32,
        msg: Message,
    ) -> Result<()> {
        match self.write_message(receiver, buffer, msg) {
            Ok(()) => self.wake(receiver, KERR_NONE),
            Err(_) => {
                self.objects.server_mut(server)?.queue.push_front(msg.id);
                self.wake(receiver, KERR_BAD_DESCRIPTOR)
            }
        }
    }

    fn write_message(&mut self, thread: ObjectId, buffer: u32, msg: Message) -> Result<()> {
        let process = self.objects.thread(thread)?.process;
        let space = self.objects.process(process)?.space;
        self.mem.write(space, u64::from(buffer), &msg.to_wire())?;
        Ok(())
    }

    /// Take the next message for `server` into `buffer`, blocking if none is queued.
    pub fn receive(&mut self, thread: ObjectId, server: ObjectId, buffer: u32) -> Result<WaitOutcome> {
        let srv = self.objects.server_mut(server)?;
        if srv.owner_thread != Some(thread) {
            return Err(KernelError::AccessDenied("only the server thread may receive"));
        }
        if srv.receiver.is_some() {
            return Err(KernelError::InUse("server already has a pending receive"));
        }
        let Some(id) = srv.queue.pop_front() else {
            srv.receiver = Some((thread, buffer));
            self.block(thread, WaitReason::Receive { server, buffer })?;
            return Ok(WaitOutcome::Blocked);
        };
        let msg = *self.messages.get(&id).ok_or_else(|| {
            KernelError::InvariantViolation(format!("queued message {id} does not exist"))
        })?;
        if let Err(e) = self.write_message(thread, buffer, msg) {
            self.objects.server_mut(server)?.queue.push_front(id);
            return Err(e);
        }
        Ok(WaitOutcome::Completed(KERR_NONE))
    }

    /// Finish a received message: its client wakes with `result`.
    pub fn complete_message(&mut self, thread: ObjectId, id: u32, result: i32) -> Result<()> {
        let msg = *self
            .messages
            .get(&id)
            .ok_or(KernelError::InvalidArgument("unknown message"))?;
        let process = self.objects.thread(thread)?.process;
        if self.objects.get(msg.server)?.owner != Some(process) {
            return Err(KernelError::AccessDenied("message belongs to another server"));
        }
        if self
            .objects
            .server(msg.server)?
            .queue
            .contains(&id)
        {
            return Err(KernelError::InvalidArgument("message has not been received"));
        }
        self.messages.remove(&id);
        if let Ok(s) = self.objects.session_mut(msg.session) {
            if s.outstanding == Some(id) {
                s.outstanding = None;
            }
        }
        if self.is_waiting_on(msg.client, WaitReason::Reply(msg.session)) {
            self.wake(msg.client, result)?;
        }
        trace!(message = id, result, "message completed");
        Ok(())
    }

    /// Fail every message of a destroyed server with `KErrDied` and orphan its sessions.
    pub(crate) fn server_gone(&mut self, server: ObjectId, state: Server) -> Result<()> {
        if let Some((receiver, _)) = state.receiver {
            self.wake(receiver, KERR_CANCEL)?;
        }
        let orphaned: Vec<Message> = self
            .messages
            .values()
            .filter(|m| m.server == server)
            .copied()
            .collect();
        for msg in orphaned {
            self.messages.remove(&msg.id);
            if self.is_waiting_on(msg.client, WaitReason::Reply(msg.session)) {
                self.wake(msg.client, KERR_DIED)?;
            }
        }
        let sessions: Vec<ObjectId> = self.objects.ids_of_kind(ObjectKind::Session).collect();
        for id in sessions {
            let s = self.objects.session_mut(id)?;
            if s.server == Some(server) {
                s.server = None;
                s.outstanding = None;
            }
        }
        Ok(())
    }

    /// Withdraw an undelivered message of a destroyed session.
    pub(crate) fn session_gone(&mut self, session: ObjectId, state: Session) -> Result<()> {
        let Some(id) = state.outstanding else {
            return Ok(());
        };
        let Some(msg) = self.messages.get(&id).copied() else {
            return Ok(());
        };
        if let Ok(srv) = self.objects.server_mut(msg.server) {
            if let Some(pos) = srv.queue.iter().position(|&q| q == id) {
                srv.queue.remove(pos);
                self.messages.remove(&id);
            }
        }
        if self.is_waiting_on(msg.client, WaitReason::Reply(session)) {
            self.wake(msg.client, KERR_DIED)?;
        }
        Ok(())
    }
}
