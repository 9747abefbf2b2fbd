//! IPC server implementation

use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tenrol_api::{
    ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, Event, Request, Response, API_VERSION,
};
use tenrol_util::ClientId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult};

/// Events buffered per subscriber before the slowest one starts lagging
const EVENT_BUFFER: usize = 256;

/// Message from a connection to the daemon
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

type Clients = Arc<RwLock<HashMap<ClientId, ClientHandle>>>;

/// IPC Server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Clients,
    event_tx: broadcast::Sender<Event>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>>,
}

struct ClientHandle {
    info: ClientInfo,
    response_tx: mpsc::UnboundedSender<Response>,
    subscribed: bool,
}

/// Role granted to a peer: root and the daemon's own user may mutate state
pub fn role_for_uid(uid: Option<u32>, daemon_uid: u32) -> ClientRole {
    match uid {
        Some(0) => ClientRole::Admin,
        Some(u) if u == daemon_uid => ClientRole::Admin,
        _ => ClientRole::Observer,
    }
}

/// Parse one request line. Failures come back as the response to send.
fn parse_request(line: &str) -> Result<Request, Response> {
    let request: Request = serde_json::from_str(line).map_err(|e| {
        Response::error(
            0,
            ErrorInfo::new(ErrorCode::InvalidRequest, format!("Malformed request: {}", e)),
        )
    })?;

    if request.api_version != API_VERSION {
        return Err(Response::error(
            request.request_id,
            ErrorInfo::new(
                ErrorCode::InvalidRequest,
                format!(
                    "Unsupported API version {} (expected {})",
                    request.api_version, API_VERSION
                ),
            ),
        ));
    }

    Ok(request)
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> IpcResult<()> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            message_tx,
            message_rx: Arc::new(Mutex::new(Some(message_rx))),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one from a previous run
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner and group only
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");

        self.listener = Some(listener);

        Ok(())
    }

    /// Get receiver for server messages
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Accept connections in a loop
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;
        let daemon_uid = nix::unistd::getuid().as_raw();

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let uid = get_peer_uid(&stream);
                    let mut info = ClientInfo::new(role_for_uid(uid, daemon_uid));
                    if let Some(uid) = uid {
                        info = info.with_uid(uid);
                    }

                    debug!(client_id = %info.client_id, uid = ?uid, role = ?info.role, "Accepted connection");

                    self.register(stream, info).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn register(&self, stream: UnixStream, info: ClientInfo) {
        let client_id = info.client_id.clone();
        let (read_half, write_half) = stream.into_split();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        self.clients.write().await.insert(
            client_id.clone(),
            ClientHandle {
                info: info.clone(),
                response_tx: response_tx.clone(),
                subscribed: false,
            },
        );

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        tokio::spawn(read_requests(
            read_half,
            client_id.clone(),
            self.clients.clone(),
            self.message_tx.clone(),
            response_tx,
        ));

        tokio::spawn(write_outgoing(
            write_half,
            client_id,
            self.clients.clone(),
            self.message_tx.clone(),
            response_rx,
            self.event_tx.subscribe(),
        ));
    }

    /// Queue a response for a specific client. A client that already left is not an error.
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let clients = self.clients.read().await;
        match clients.get(client_id) {
            Some(handle) => handle
                .response_tx
                .send(response)
                .map_err(|_| IpcError::ConnectionClosed),
            None => {
                debug!(client_id = %client_id, "Dropping response for departed client");
                Ok(())
            }
        }
    }

    /// Broadcast an event to all subscribed clients
    pub fn broadcast_event(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    /// Get client info
    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|h| h.info.clone())
    }

    /// Remove the socket file
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parse requests and forward them to the daemon until EOF
async fn read_requests(
    read_half: OwnedReadHalf,
    client_id: ClientId,
    clients: Clients,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    response_tx: mpsc::UnboundedSender<Response>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(client_id = %client_id, "Client disconnected (EOF)");
                break;
            }
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => match parse_request(line.trim()) {
                Ok(request) => {
                    let subscribed = match request.command {
                        Command::SubscribeEvents => Some(true),
                        Command::UnsubscribeEvents => Some(false),
                        _ => None,
                    };
                    // Flip before forwarding so no event slips between ack and flag
                    if let Some(subscribed) = subscribed
                        && let Some(handle) = clients.write().await.get_mut(&client_id)
                    {
                        handle.subscribed = subscribed;
                    }

                    let _ = message_tx.send(ServerMessage::Request {
                        client_id: client_id.clone(),
                        request,
                    });
                }
                Err(rejection) => {
                    warn!(client_id = %client_id, "Rejected request line");
                    let _ = response_tx.send(rejection);
                }
            },
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Read error");
                break;
            }
        }
    }

    // Dropping the last response sender stops the writer
    clients.write().await.remove(&client_id);
}

/// Write responses, plus broadcast events while the client is subscribed
async fn write_outgoing(
    mut writer: OwnedWriteHalf,
    client_id: ClientId,
    clients: Clients,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    mut response_rx: mpsc::UnboundedReceiver<Response>,
    mut event_rx: broadcast::Receiver<Event>,
) {
    loop {
        tokio::select! {
            // Responses go out before any event queued after them
            biased;

            response = response_rx.recv() => {
                let Some(response) = response else {
                    break;
                };
                if let Err(e) = write_line(&mut writer, &response).await {
                    debug!(client_id = %client_id, error = %e, "Write error");
                    break;
                }
            }

            event = event_rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id = %client_id, skipped, "Subscriber lagging, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let subscribed = clients
                    .read()
                    .await
                    .get(&client_id)
                    .is_some_and(|h| h.subscribed);

                if subscribed && let Err(e) = write_line(&mut writer, &event).await {
                    debug!(client_id = %client_id, error = %e, "Event write error");
                    break;
                }
            }
        }
    }

    let _ = message_tx.send(ServerMessage::ClientDisconnected {
        client_id: client_id.clone(),
    });
    clients.write().await.remove(&client_id);
}

/// Get peer UID from Unix socket
fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    nix::sys::socket::getsockopt(&stream.as_fd(), nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|cred| cred.uid())
}
