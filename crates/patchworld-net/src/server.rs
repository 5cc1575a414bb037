//! The simulation server: accepts clients over TCP, enforces per-client
//! permissions, relays RPC calls into the simulator, and broadcasts a step
//! message to every connected client after each tick.
//!
//! The tokio runtime lives on a dedicated thread so the server can be hosted
//! from synchronous code; shutdown is signaled through a [`Notify`].

use crate::{encode_frame, NetError, MAX_FRAME_LEN};
use patchworld_core::{Simulator, SimulatorError, StepListener, StepOutcome};
use patchworld_proto::{
    Hello, PatchReply, Permissions, Request, RequestEnvelope, Response, ServerMessage, Status,
    Welcome,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Configuration for a hosted simulation server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Permissions granted to newly connected clients.
    pub default_permissions: Permissions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9460".parse().expect("hard-coded loopback socket"),
            default_permissions: Permissions::all(),
        }
    }
}

struct ClientEntry {
    permissions: Permissions,
    agents: HashSet<u64>,
    sender: Option<UnboundedSender<ServerMessage>>,
}

struct ServerShared {
    sim: Arc<Simulator>,
    default_permissions: Permissions,
    clients: Mutex<HashMap<u64, ClientEntry>>,
    next_client_id: AtomicU64,
}

impl ServerShared {
    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Forwards each completed tick to every connected client, restricted to the
/// agents that client owns.
struct StepBroadcaster {
    shared: Weak<ServerShared>,
}

impl StepListener for StepBroadcaster {
    fn on_step(&mut self, outcome: &StepOutcome) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let clients = shared.lock_clients();
        for entry in clients.values() {
            let Some(sender) = &entry.sender else {
                continue;
            };
            let agents: Vec<_> = outcome
                .agents
                .iter()
                .filter(|agent| entry.agents.contains(&agent.id))
                .cloned()
                .collect();
            let _ = sender.send(ServerMessage::Step {
                tick: outcome.tick,
                agents,
            });
        }
    }
}

/// A running simulation server. Dropping it shuts the server down.
pub struct SimulationServer {
    shared: Arc<ServerShared>,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl SimulationServer {
    /// Bind and launch the server on a dedicated runtime thread. The
    /// simulator's step listener is replaced with the server's broadcaster.
    pub fn launch(sim: Arc<Simulator>, config: ServerConfig) -> Result<Self, NetError> {
        let listener = std::net::TcpListener::bind(config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            sim: Arc::clone(&sim),
            default_permissions: config.default_permissions,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        });
        sim.set_listener(Box::new(StepBroadcaster {
            shared: Arc::downgrade(&shared),
        }));

        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = Arc::clone(&shutdown);
        let shared_clone = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name("patchworld-server".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_multi_thread()
                    .thread_name("patchworld-server-rt")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(async move {
                        if let Err(err) =
                            run_accept_loop(listener, shared_clone, shutdown_clone).await
                        {
                            error!(?err, "server accept loop terminated");
                        }
                    }),
                    Err(err) => error!(?err, "failed to build server runtime"),
                }
            })
            .map_err(NetError::Io)?;

        info!(address = %local_addr, "simulation server listening");
        Ok(Self {
            shared,
            shutdown,
            thread: Some(thread),
            local_addr,
        })
    }

    /// The bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A client's current permission set.
    #[must_use]
    pub fn get_permissions(&self, client_id: u64) -> Option<Permissions> {
        self.shared
            .lock_clients()
            .get(&client_id)
            .map(|entry| entry.permissions)
    }

    /// Replace a client's permission set.
    pub fn set_permissions(&self, client_id: u64, permissions: Permissions) -> bool {
        match self.shared.lock_clients().get_mut(&client_id) {
            Some(entry) => {
                entry.permissions = permissions;
                true
            }
            None => false,
        }
    }

    /// Forcibly drop a client: its agents are removed from the simulation
    /// and it is told the connection is gone.
    pub fn remove_client(&self, client_id: u64) -> bool {
        let entry = self.shared.lock_clients().remove(&client_id);
        match entry {
            Some(entry) => {
                if let Some(sender) = &entry.sender {
                    let _ = sender.send(ServerMessage::LostConnection);
                }
                for agent_id in entry.agents {
                    if let Err(err) = self.shared.sim.remove_agent(agent_id) {
                        warn!(agent_id, %err, "failed to remove agent of dropped client");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Stop accepting, drop every client, and join the runtime thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.notify_waiters();
        {
            let mut clients = self.shared.lock_clients();
            for entry in clients.values_mut() {
                if let Some(sender) = entry.sender.take() {
                    let _ = sender.send(ServerMessage::LostConnection);
                }
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("server thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SimulationServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_inner();
        }
    }
}

async fn run_accept_loop(
    listener: std::net::TcpListener,
    shared: Arc<ServerShared>,
    shutdown: Arc<Notify>,
) -> Result<(), NetError> {
    let listener = TcpListener::from_std(listener)?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(err) = serve_client(stream, shared).await {
                        info!(%peer, %err, "client session ended");
                    }
                });
            }
            () = shutdown.notified() => {
                info!("simulation server shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_client(stream: TcpStream, shared: Arc<ServerShared>) -> Result<(), NetError> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();

    let hello: Hello = read_frame_async(&mut reader).await?;
    let (sender, receiver) = mpsc::unbounded_channel::<ServerMessage>();

    // Reclaim a previous session on reconnect, otherwise mint a fresh id.
    let client_id = match hello.reconnect_client_id {
        Some(id)
            if shared
                .lock_clients()
                .get(&id)
                .is_some_and(|entry| entry.sender.is_none()) =>
        {
            id
        }
        _ => shared.next_client_id.fetch_add(1, Ordering::Relaxed),
    };

    let agent_ids: Vec<u64> = shared
        .lock_clients()
        .get(&client_id)
        .map(|entry| entry.agents.iter().copied().collect())
        .unwrap_or_default();
    // The welcome goes into the channel before the entry becomes visible to
    // the step broadcaster, so it is always the first frame on the wire.
    let _ = sender.send(ServerMessage::Welcome(Welcome {
        client_id,
        agent_ids,
        simulator_tick: shared.sim.tick(),
    }));
    {
        let mut clients = shared.lock_clients();
        let entry = clients.entry(client_id).or_insert_with(|| ClientEntry {
            permissions: shared.default_permissions,
            agents: HashSet::new(),
            sender: None,
        });
        entry.sender = Some(sender.clone());
    }
    info!(client_id, "client connected");

    let writer_task = tokio::spawn(write_loop(writer, receiver));

    let result = read_loop(&mut reader, client_id, &shared).await;

    // Keep the entry for reconnect, but release this tick's obligations.
    let owned: Vec<u64> = {
        let mut clients = shared.lock_clients();
        match clients.get_mut(&client_id) {
            Some(entry) => {
                entry.sender = None;
                entry.agents.iter().copied().collect()
            }
            None => Vec::new(),
        }
    };
    if !owned.is_empty() {
        // Relinquishing can complete a quorum and run a whole step; keep
        // that work off the async reactor.
        let sim = Arc::clone(&shared.sim);
        let _ = tokio::task::spawn_blocking(move || {
            for agent_id in owned {
                if sim.is_active(agent_id).unwrap_or(false) {
                    if let Err(err) = sim.relinquish(agent_id) {
                        warn!(agent_id, %err, "failed to relinquish agent after disconnect");
                    }
                }
            }
        })
        .await;
    }
    info!(client_id, "client disconnected");

    writer_task.abort();
    result
}

async fn read_loop(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    client_id: u64,
    shared: &Arc<ServerShared>,
) -> Result<(), NetError> {
    loop {
        let envelope: RequestEnvelope = match read_frame_async(reader).await {
            Ok(envelope) => envelope,
            Err(NetError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let shared_clone = Arc::clone(shared);
        let response = tokio::task::spawn_blocking(move || {
            dispatch(&shared_clone, client_id, envelope.request)
        })
        .await
        .map_err(|_| NetError::Protocol("request handler panicked"))?;

        let reply = ServerMessage::Reply {
            request_id: envelope.request_id,
            response,
        };
        let sent = shared
            .lock_clients()
            .get(&client_id)
            .and_then(|entry| entry.sender.as_ref().map(|s| s.send(reply).is_ok()))
            .unwrap_or(false);
        if !sent {
            return Ok(());
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = receiver.recv().await {
        let lost = matches!(message, ServerMessage::LostConnection);
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "failed to encode outbound frame");
                continue;
            }
        };
        if writer.write_all(&frame).await.is_err() {
            return;
        }
        if lost {
            let _ = writer.shutdown().await;
            return;
        }
    }
}

async fn read_frame_async<T: serde::de::DeserializeOwned>(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<T, NetError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|_| NetError::Protocol("deserialize failed"))
}

fn status_of(result: Result<(), SimulatorError>) -> Status {
    match result {
        Ok(()) => Status::Ok,
        Err(err) => Status::from(&err),
    }
}

/// Execute one request on behalf of a client, enforcing permissions and
/// agent ownership. Denied calls never reach the simulator.
fn dispatch(shared: &ServerShared, client_id: u64, request: Request) -> Response {
    let permissions = shared
        .lock_clients()
        .get(&client_id)
        .map(|entry| entry.permissions)
        .unwrap_or_else(Permissions::none);
    let owns = |agent_id: u64| {
        shared
            .lock_clients()
            .get(&client_id)
            .is_some_and(|entry| entry.agents.contains(&agent_id))
    };
    let sim = &shared.sim;

    match request {
        Request::AddAgent => {
            if !permissions.add_agent {
                return Response::AgentAdded {
                    status: Status::PermissionDenied,
                    agent: None,
                };
            }
            match sim.add_agent() {
                Ok(agent) => {
                    if let Some(entry) = shared.lock_clients().get_mut(&client_id) {
                        entry.agents.insert(agent.id);
                    }
                    Response::AgentAdded {
                        status: Status::Ok,
                        agent: Some(agent),
                    }
                }
                Err(err) => Response::AgentAdded {
                    status: Status::from(&err),
                    agent: None,
                },
            }
        }
        Request::RemoveAgent { agent_id } => {
            if !permissions.remove_agent {
                return Response::AgentRemoved {
                    status: Status::PermissionDenied,
                };
            }
            let status = status_of(sim.remove_agent(agent_id));
            if status == Status::Ok {
                if let Some(entry) = shared.lock_clients().get_mut(&client_id) {
                    entry.agents.remove(&agent_id);
                }
            }
            Response::AgentRemoved { status }
        }
        Request::AddSemaphore => {
            if !permissions.manage_semaphores {
                return Response::SemaphoreAdded {
                    status: Status::PermissionDenied,
                    semaphore_id: None,
                };
            }
            Response::SemaphoreAdded {
                status: Status::Ok,
                semaphore_id: Some(sim.add_semaphore()),
            }
        }
        Request::RemoveSemaphore { semaphore_id } => Response::SemaphoreRemoved {
            status: if permissions.manage_semaphores {
                status_of(sim.remove_semaphore(semaphore_id))
            } else {
                Status::PermissionDenied
            },
        },
        Request::SignalSemaphore { semaphore_id } => Response::SemaphoreSignaled {
            status: if permissions.manage_semaphores {
                status_of(sim.signal_semaphore(semaphore_id))
            } else {
                Status::PermissionDenied
            },
        },
        Request::UnsignalSemaphore { semaphore_id } => Response::SemaphoreUnsignaled {
            status: if permissions.manage_semaphores {
                status_of(sim.unsignal_semaphore(semaphore_id))
            } else {
                Status::PermissionDenied
            },
        },
        Request::GetSemaphores => {
            if !permissions.get_semaphores {
                return Response::Semaphores {
                    status: Status::PermissionDenied,
                    semaphores: Vec::new(),
                };
            }
            Response::Semaphores {
                status: Status::Ok,
                semaphores: sim.get_semaphores(),
            }
        }
        Request::Move {
            agent_id,
            direction,
            num_steps,
        } => Response::Acted {
            status: if owns(agent_id) {
                status_of(sim.move_agent(agent_id, direction, num_steps))
            } else {
                Status::PermissionDenied
            },
        },
        Request::Turn {
            agent_id,
            direction,
        } => Response::Acted {
            status: if owns(agent_id) {
                status_of(sim.turn_agent(agent_id, direction))
            } else {
                Status::PermissionDenied
            },
        },
        Request::NoOp { agent_id } => Response::Acted {
            status: if owns(agent_id) {
                status_of(sim.no_op(agent_id))
            } else {
                Status::PermissionDenied
            },
        },
        Request::GetMap {
            bottom_left,
            top_right,
            want_scent,
            want_vision,
        } => {
            if !permissions.get_map {
                return Response::Map {
                    status: Status::PermissionDenied,
                    patches: Vec::new(),
                };
            }
            match sim.get_map(bottom_left, top_right, want_scent, want_vision) {
                Ok(patches) => Response::Map {
                    status: Status::Ok,
                    patches: patches
                        .into_iter()
                        .map(|patch| PatchReply {
                            position: patch.position,
                            fixed: patch.fixed,
                            items: patch.items,
                            scent: patch.scent,
                            colors: patch.colors,
                        })
                        .collect(),
                },
                Err(err) => Response::Map {
                    status: Status::from(&err),
                    patches: Vec::new(),
                },
            }
        }
        Request::GetAgentIds => {
            if !permissions.get_agent_ids {
                return Response::AgentIds {
                    status: Status::PermissionDenied,
                    agent_ids: Vec::new(),
                };
            }
            Response::AgentIds {
                status: Status::Ok,
                agent_ids: sim.agent_ids(),
            }
        }
        Request::GetAgentStates { agent_ids } => {
            if !permissions.get_agent_states {
                return Response::AgentStates {
                    status: Status::PermissionDenied,
                    agents: Vec::new(),
                };
            }
            Response::AgentStates {
                status: Status::Ok,
                agents: sim.agent_states(&agent_ids),
            }
        }
        Request::SetActive { agent_id, active } => Response::ActiveSet {
            status: if permissions.set_active {
                status_of(sim.set_active(agent_id, active))
            } else {
                Status::PermissionDenied
            },
        },
        Request::IsActive { agent_id } => match sim.is_active(agent_id) {
            Ok(active) => Response::Active {
                status: Status::Ok,
                active,
            },
            Err(err) => Response::Active {
                status: Status::from(&err),
                active: false,
            },
        },
    }
}
