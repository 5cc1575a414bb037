//! Blocking client handle for a remote simulation server.
//!
//! A dedicated reader thread routes replies back to waiting callers by
//! request id and delivers unsolicited `step` and `lost_connection` messages
//! to the registered callbacks.

use crate::{read_frame_sync, write_frame_sync, NetError};
use patchworld_core::{AgentState, Direction, Position};
use patchworld_proto::{
    Hello, PatchReply, Request, RequestEnvelope, Response, ServerMessage, Status,
};
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Called for every per-tick step broadcast.
pub type StepCallback = Box<dyn FnMut(u64, Vec<AgentState>) + Send>;
/// Called once when the server connection is lost.
pub type LostConnectionCallback = Box<dyn FnOnce() + Send>;

struct ClientInner {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u64, SyncSender<Response>>>,
    running: AtomicBool,
}

/// A connected client.
pub struct Client {
    inner: Arc<ClientInner>,
    next_request_id: AtomicU64,
    client_id: u64,
    agent_ids: Vec<u64>,
    server_tick: u64,
    reader: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect as a new client.
    pub fn connect(
        addr: SocketAddr,
        on_step: StepCallback,
        on_lost_connection: LostConnectionCallback,
    ) -> Result<Self, NetError> {
        Self::connect_inner(addr, None, on_step, on_lost_connection)
    }

    /// Reconnect with a previous session's client id, reclaiming its agents.
    pub fn reconnect(
        addr: SocketAddr,
        client_id: u64,
        on_step: StepCallback,
        on_lost_connection: LostConnectionCallback,
    ) -> Result<Self, NetError> {
        Self::connect_inner(addr, Some(client_id), on_step, on_lost_connection)
    }

    fn connect_inner(
        addr: SocketAddr,
        reconnect_client_id: Option<u64>,
        mut on_step: StepCallback,
        on_lost_connection: LostConnectionCallback,
    ) -> Result<Self, NetError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        write_frame_sync(&mut stream, &Hello {
            reconnect_client_id,
        })?;

        let mut read_stream = BufReader::new(stream.try_clone()?);
        let welcome = match read_frame_sync::<ServerMessage>(&mut read_stream)? {
            ServerMessage::Welcome(welcome) => welcome,
            _ => return Err(NetError::Protocol("expected welcome frame")),
        };
        info!(client_id = welcome.client_id, "connected to simulation server");

        let inner = Arc::new(ClientInner {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        });

        let reader_inner = Arc::clone(&inner);
        let reader = thread::Builder::new()
            .name("patchworld-client-reader".into())
            .spawn(move || {
                let mut on_lost = Some(on_lost_connection);
                loop {
                    match read_frame_sync::<ServerMessage>(&mut read_stream) {
                        Ok(ServerMessage::Reply {
                            request_id,
                            response,
                        }) => {
                            let sender = reader_inner
                                .pending
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .remove(&request_id);
                            match sender {
                                Some(sender) => {
                                    let _ = sender.send(response);
                                }
                                None => warn!(request_id, "reply for unknown request"),
                            }
                        }
                        Ok(ServerMessage::Step { tick, agents }) => on_step(tick, agents),
                        Ok(ServerMessage::Welcome(_)) => {
                            warn!("unexpected welcome after handshake");
                        }
                        Ok(ServerMessage::LostConnection) | Err(_) => {
                            let was_running =
                                reader_inner.running.swap(false, Ordering::SeqCst);
                            // Wake every waiting caller.
                            reader_inner
                                .pending
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .clear();
                            if was_running {
                                if let Some(on_lost) = on_lost.take() {
                                    on_lost();
                                }
                            }
                            return;
                        }
                    }
                }
            })
            .map_err(NetError::Io)?;

        Ok(Self {
            inner,
            next_request_id: AtomicU64::new(1),
            client_id: welcome.client_id,
            agent_ids: welcome.agent_ids,
            server_tick: welcome.simulator_tick,
            reader: Some(reader),
        })
    }

    /// The server-assigned client id, needed for reconnecting.
    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Agents reclaimed at connect time (empty for fresh connections).
    #[must_use]
    pub fn reclaimed_agent_ids(&self) -> &[u64] {
        &self.agent_ids
    }

    /// Simulator tick observed at connect time.
    #[must_use]
    pub fn server_tick_at_connect(&self) -> u64 {
        self.server_tick
    }

    /// Issue a raw request and wait for its reply.
    pub fn call(&self, request: Request) -> Result<Response, NetError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(NetError::ConnectionLost);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = sync_channel(1);
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, sender);

        let write_result = {
            let mut writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
            write_frame_sync(&mut *writer, &RequestEnvelope {
                request_id,
                request,
            })
        };
        if let Err(err) = write_result {
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err(err);
        }

        receiver.recv().map_err(|_| NetError::ConnectionLost)
    }

    /// Create a new agent owned by this client.
    pub fn add_agent(&self) -> Result<AgentState, NetError> {
        match self.call(Request::AddAgent)? {
            Response::AgentAdded {
                status: Status::Ok,
                agent: Some(agent),
            } => Ok(agent),
            Response::AgentAdded { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn remove_agent(&self, agent_id: u64) -> Result<(), NetError> {
        match self.call(Request::RemoveAgent { agent_id })? {
            Response::AgentRemoved { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn move_agent(
        &self,
        agent_id: u64,
        direction: Direction,
        num_steps: u32,
    ) -> Result<(), NetError> {
        match self.call(Request::Move {
            agent_id,
            direction,
            num_steps,
        })? {
            Response::Acted { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn turn_agent(&self, agent_id: u64, direction: Direction) -> Result<(), NetError> {
        match self.call(Request::Turn {
            agent_id,
            direction,
        })? {
            Response::Acted { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn no_op(&self, agent_id: u64) -> Result<(), NetError> {
        match self.call(Request::NoOp { agent_id })? {
            Response::Acted { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn add_semaphore(&self) -> Result<u64, NetError> {
        match self.call(Request::AddSemaphore)? {
            Response::SemaphoreAdded {
                status: Status::Ok,
                semaphore_id: Some(id),
            } => Ok(id),
            Response::SemaphoreAdded { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn remove_semaphore(&self, semaphore_id: u64) -> Result<(), NetError> {
        match self.call(Request::RemoveSemaphore { semaphore_id })? {
            Response::SemaphoreRemoved { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn signal_semaphore(&self, semaphore_id: u64) -> Result<(), NetError> {
        match self.call(Request::SignalSemaphore { semaphore_id })? {
            Response::SemaphoreSignaled { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn unsignal_semaphore(&self, semaphore_id: u64) -> Result<(), NetError> {
        match self.call(Request::UnsignalSemaphore { semaphore_id })? {
            Response::SemaphoreUnsignaled { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn get_semaphores(&self) -> Result<Vec<(u64, bool)>, NetError> {
        match self.call(Request::GetSemaphores)? {
            Response::Semaphores {
                status: Status::Ok,
                semaphores,
            } => Ok(semaphores),
            Response::Semaphores { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn get_map(
        &self,
        bottom_left: Position,
        top_right: Position,
        want_scent: bool,
        want_vision: bool,
    ) -> Result<Vec<PatchReply>, NetError> {
        match self.call(Request::GetMap {
            bottom_left,
            top_right,
            want_scent,
            want_vision,
        })? {
            Response::Map {
                status: Status::Ok,
                patches,
            } => Ok(patches),
            Response::Map { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn get_agent_ids(&self) -> Result<Vec<u64>, NetError> {
        match self.call(Request::GetAgentIds)? {
            Response::AgentIds {
                status: Status::Ok,
                agent_ids,
            } => Ok(agent_ids),
            Response::AgentIds { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn get_agent_states(
        &self,
        agent_ids: Vec<u64>,
    ) -> Result<Vec<Option<AgentState>>, NetError> {
        match self.call(Request::GetAgentStates { agent_ids })? {
            Response::AgentStates {
                status: Status::Ok,
                agents,
            } => Ok(agents),
            Response::AgentStates { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn set_active(&self, agent_id: u64, active: bool) -> Result<(), NetError> {
        match self.call(Request::SetActive { agent_id, active })? {
            Response::ActiveSet { status } => expect_ok(status),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    pub fn is_active(&self, agent_id: u64) -> Result<bool, NetError> {
        match self.call(Request::IsActive { agent_id })? {
            Response::Active {
                status: Status::Ok,
                active,
            } => Ok(active),
            Response::Active { status, .. } => Err(NetError::Rejected(status)),
            _ => Err(NetError::Protocol("mismatched response")),
        }
    }

    /// Close the connection and join the reader thread.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Ok(writer) = self.inner.writer.lock() {
            let _ = writer.shutdown(std::net::Shutdown::Both);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.stop_inner();
        }
    }
}

fn expect_ok(status: Status) -> Result<(), NetError> {
    if status == Status::Ok {
        Ok(())
    } else {
        Err(NetError::Rejected(status))
    }
}
