//! tenrold - The temporary enrolment service
//!
//! This is the main entry point for the tenrold service.
//! It wires together all the components:
//! - Configuration loading and SIGHUP reload
//! - Tracking store
//! - Lifecycle engine and the periodic sweeps
//! - SQLite host adapter (LMS tables and mail outbox)
//! - IPC server

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tenrol_api::{
    ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Response,
    ResponsePayload,
};
use tenrol_config::{load_config, Settings};
use tenrol_core::{CoreEvent, EngineError, LifecycleEngine};
use tenrol_host_api::{HostEvent, HostPlatform};
use tenrol_host_sqlite::SqlitePlatform;
use tenrol_ipc::{IpcServer, ServerMessage};
use tenrol_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use tenrol_util::{default_config_path, ClientId};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// tenrold - Temporary course enrolments driven by a marker role
#[derive(Parser, Debug)]
#[command(name = "tenrold")]
#[command(about = "Temporary course enrolments driven by a marker role", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/tenrol/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set TENROL_SOCKET env var)
    #[arg(short, long, env = "TENROL_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set TENROL_DATA_DIR env var)
    #[arg(short, long, env = "TENROL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// LMS database override (or set TENROL_HOST_DB env var)
    #[arg(long, env = "TENROL_HOST_DB")]
    host_db: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Engine plus the settings snapshot it runs against
struct State {
    engine: LifecycleEngine,
    settings: Settings,
    config_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Expiration,
    Reminder,
}

/// Main service state
struct Service {
    state: State,
    platform: Arc<SqlitePlatform>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let settings = load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            enabled = settings.enrolments.enabled,
            marker_role_id = ?settings.enrolments.marker_role,
            duration_seconds = settings.enrolments.duration_seconds,
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| settings.daemon.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.daemon.data_dir.clone());

        let host_db = args
            .host_db
            .clone()
            .unwrap_or_else(|| settings.daemon.host_db.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join("tenrold.db");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let platform = Arc::new(
            SqlitePlatform::open(&host_db)
                .with_context(|| format!("Failed to open LMS database {:?}", host_db))?,
        );

        info!(host_db = %host_db.display(), "Host adapter initialized");

        // The host database doubles as the mail transport (outbox table)
        let engine = LifecycleEngine::new(store.clone(), platform.clone(), platform.clone());

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %ipc.socket_path().display(), "IPC server started");

        Ok(Self {
            state: State {
                engine,
                settings,
                config_path: args.config.clone(),
            },
            platform,
            ipc: Arc::new(ipc),
            store,
        })
    }

    async fn run(self) -> Result<()> {
        let mut host_events = self.platform.subscribe();
        let ipc = self.ipc.clone();
        let mut ipc_messages = ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let mut expire_timer = tokio::time::interval(self.state.settings.daemon.expire_sweep_interval);
        expire_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut remind_timer =
            tokio::time::interval(self.state.settings.daemon.reminder_sweep_interval);
        remind_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = Arc::new(Mutex::new(self.state));
        let store = self.store.clone();

        let ipc_accept = ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        // Adopt assignments made while the service was down
        if let Err(e) = Self::backfill(&state, &ipc).await {
            error!(code = ?e.code, error = %e.message, "Startup backfill failed");
        }

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }

                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    if let Err(e) = Self::reload(&state, &ipc).await {
                        warn!(code = ?e.code, error = %e.message, "Configuration reload failed");
                    }
                }

                _ = expire_timer.tick() => {
                    if let Err(e) = Self::sweep(&state, &ipc, Sweep::Expiration).await {
                        error!(code = ?e.code, error = %e.message, "Expiration sweep failed");
                    }
                }

                _ = remind_timer.tick() => {
                    if let Err(e) = Self::sweep(&state, &ipc, Sweep::Reminder).await {
                        error!(code = ?e.code, error = %e.message, "Reminder sweep failed");
                    }
                }

                // Role changes made by the engine itself (revocations, upgrades)
                Some(host_event) = host_events.recv() => {
                    Self::handle_host_event(&state, &ipc, host_event).await;
                }

                Some(msg) = ipc_messages.recv() => {
                    Self::handle_ipc_message(&state, &ipc, &store, msg).await;
                }
            }
        }

        info!("Shutting down tenrold");

        ipc.shutdown();

        if let Err(e) = store.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    async fn sweep(state: &Mutex<State>, ipc: &IpcServer, sweep: Sweep) -> Result<usize, ErrorInfo> {
        let now = tenrol_util::unix_now();
        let st = state.lock().await;

        let outcome = match sweep {
            Sweep::Expiration => st.engine.run_expiration_sweep(&st.settings, now),
            Sweep::Reminder => st.engine.run_reminder_sweep(&st.settings, now),
        }
        .map_err(engine_error)?;

        debug!(sweep = ?sweep, processed = outcome.processed, "Sweep finished");
        broadcast_core_events(ipc, outcome.events);
        Ok(outcome.processed)
    }

    async fn backfill(state: &Mutex<State>, ipc: &IpcServer) -> Result<(usize, usize), ErrorInfo> {
        let st = state.lock().await;
        let outcome = st
            .engine
            .run_backfill(&st.settings, tenrol_util::unix_now())
            .map_err(engine_error)?;

        let counts = (outcome.purged, outcome.created);
        broadcast_core_events(ipc, outcome.events);
        Ok(counts)
    }

    /// Re-read the config file and react to marker or duration changes
    async fn reload(state: &Mutex<State>, ipc: &IpcServer) -> Result<(), ErrorInfo> {
        let mut guard = state.lock().await;
        let st = &mut *guard;

        let settings = match load_config(&st.config_path) {
            Ok(settings) => settings,
            Err(e) => {
                let _ = st.engine.store().append_audit(AuditEvent::new(
                    AuditEventType::ConfigReloaded {
                        success: false,
                        marker_role_id: st.settings.active_marker_role(),
                    },
                ));
                return Err(ErrorInfo::new(ErrorCode::ConfigError, e.to_string()));
            }
        };

        let old = &st.settings.daemon;
        let new = &settings.daemon;
        if old.socket_path != new.socket_path
            || old.data_dir != new.data_dir
            || old.host_db != new.host_db
            || old.expire_sweep_interval != new.expire_sweep_interval
            || old.reminder_sweep_interval != new.reminder_sweep_interval
        {
            warn!("[daemon] settings changed, restart tenrold to apply them");
        }

        let marker_changed = settings.active_marker_role() != st.settings.active_marker_role();
        let duration_changed =
            settings.enrolments.duration_seconds != st.settings.enrolments.duration_seconds;

        st.settings = settings;

        info!(
            marker_role_id = ?st.settings.active_marker_role(),
            duration_seconds = st.settings.enrolments.duration_seconds,
            marker_changed,
            duration_changed,
            "Configuration reloaded"
        );

        let _ = st
            .engine
            .store()
            .append_audit(AuditEvent::new(AuditEventType::ConfigReloaded {
                success: true,
                marker_role_id: st.settings.active_marker_role(),
            }));
        ipc.broadcast_event(Event::new(EventPayload::ConfigReloaded));

        if marker_changed {
            let outcome = st
                .engine
                .run_backfill(&st.settings, tenrol_util::unix_now())
                .map_err(engine_error)?;
            broadcast_core_events(ipc, outcome.events);
        }

        if duration_changed {
            let outcome = st.engine.reschedule(&st.settings).map_err(engine_error)?;
            broadcast_core_events(ipc, outcome.events);
        }

        Ok(())
    }

    async fn handle_host_event(state: &Mutex<State>, ipc: &IpcServer, event: HostEvent) {
        debug!(event = ?event, "Host event");

        let st = state.lock().await;
        let result = match &event {
            HostEvent::RoleAssigned(ev) => st.engine.on_role_assigned(&st.settings, ev),
            HostEvent::RoleUnassigned(ev) => st.engine.on_role_unassigned(&st.settings, ev),
        };

        match result {
            Ok(events) => broadcast_core_events(ipc, events),
            Err(e) => error!(error = %e, "Failed to handle host event"),
        }
    }

    async fn handle_ipc_message(
        state: &Mutex<State>,
        ipc: &IpcServer,
        store: &Arc<dyn Store>,
        msg: ServerMessage,
    ) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let response =
                    Self::handle_command(state, ipc, &client_id, request.request_id, request.command)
                        .await;

                let _ = ipc.send_response(&client_id, response).await;
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientDisconnected {
                    client_id: client_id.to_string(),
                }));
            }
        }
    }

    async fn handle_command(
        state: &Mutex<State>,
        ipc: &IpcServer,
        client_id: &ClientId,
        request_id: u64,
        command: Command,
    ) -> Response {
        if command.is_mutating() {
            let role = ipc
                .get_client_info(client_id)
                .await
                .map(|info| info.role)
                .unwrap_or(ClientRole::Observer);
            if !role.can_mutate() {
                return Response::error(
                    request_id,
                    ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
                );
            }
        }

        let result = match command {
            Command::RoleAssigned(ev) => {
                let st = state.lock().await;
                st.engine
                    .on_role_assigned(&st.settings, &ev)
                    .map(|events| handled(ipc, events))
                    .map_err(engine_error)
            }

            Command::RoleUnassigned(ev) => {
                let st = state.lock().await;
                st.engine
                    .on_role_unassigned(&st.settings, &ev)
                    .map(|events| handled(ipc, events))
                    .map_err(engine_error)
            }

            Command::RunExpirationSweep => Self::sweep(state, ipc, Sweep::Expiration)
                .await
                .map(|processed| ResponsePayload::SweepCompleted { processed }),

            Command::RunReminderSweep => Self::sweep(state, ipc, Sweep::Reminder)
                .await
                .map(|processed| ResponsePayload::SweepCompleted { processed }),

            Command::RunBackfill => Self::backfill(state, ipc)
                .await
                .map(|(purged, created)| ResponsePayload::BackfillCompleted { purged, created }),

            Command::ReloadConfig => Self::reload(state, ipc)
                .await
                .map(|()| ResponsePayload::ConfigReloaded),

            Command::ListTracking => {
                let now = tenrol_util::unix_now();
                let st = state.lock().await;
                st.engine
                    .store()
                    .list_tracking()
                    .map(|records| {
                        ResponsePayload::Tracking(records.iter().map(|r| r.to_view(now)).collect())
                    })
                    .map_err(|e| ErrorInfo::new(ErrorCode::StoreError, e.to_string()))
            }

            // The server flips the subscription flag before the request gets here
            Command::SubscribeEvents => Ok(ResponsePayload::Subscribed {
                client_id: client_id.clone(),
            }),

            Command::UnsubscribeEvents => Ok(ResponsePayload::Unsubscribed),

            Command::GetHealth => {
                let st = state.lock().await;
                let store = st.engine.store();
                let tracked_count = match store.list_tracking() {
                    Ok(records) => records.len(),
                    Err(e) => {
                        warn!(error = %e, "Failed to count tracked enrolments");
                        0
                    }
                };
                Ok(ResponsePayload::Health(HealthStatus {
                    live: true,
                    ready: true,
                    store_healthy: store.is_healthy(),
                    host_healthy: st.engine.host().is_healthy(),
                    enabled: st.settings.enrolments.enabled,
                    marker_role_id: st.settings.active_marker_role(),
                    tracked_count,
                }))
            }

            Command::Ping => Ok(ResponsePayload::Pong),
        };

        match result {
            Ok(payload) => Response::success(request_id, payload),
            Err(error) => Response::error(request_id, error),
        }
    }
}

fn handled(ipc: &IpcServer, events: Vec<CoreEvent>) -> ResponsePayload {
    let changes = events.len();
    broadcast_core_events(ipc, events);
    ResponsePayload::Handled { changes }
}

fn engine_error(e: EngineError) -> ErrorInfo {
    let code = match &e {
        EngineError::Store(_) => ErrorCode::StoreError,
        EngineError::Host(_) => ErrorCode::HostError,
    };
    ErrorInfo::new(code, e.to_string())
}

fn broadcast_core_events(ipc: &IpcServer, events: Vec<CoreEvent>) {
    for event in events {
        ipc.broadcast_event(Event::new(event_payload(event)));
    }
}

fn event_payload(event: CoreEvent) -> EventPayload {
    match event {
        CoreEvent::TrackingStarted {
            role_assignment_id,
            user_id,
            time_end,
        } => EventPayload::TrackingStarted {
            role_assignment_id,
            user_id,
            time_end,
        },
        CoreEvent::AssignmentRejected {
            user_id,
            context_id,
        } => EventPayload::AssignmentRejected {
            user_id,
            context_id,
        },
        CoreEvent::Upgraded {
            role_assignment_id,
            user_id,
        } => EventPayload::Upgraded {
            role_assignment_id,
            user_id,
        },
        CoreEvent::Expired {
            role_assignment_id,
            user_id,
        } => EventPayload::Expired {
            role_assignment_id,
            user_id,
        },
        CoreEvent::Unenrolled { user_id, course_id } => {
            EventPayload::Unenrolled { user_id, course_id }
        }
        CoreEvent::EmailSent { kind, to } => EventPayload::EmailSent { kind, to },
        CoreEvent::BackfillCompleted { purged, created } => {
            EventPayload::BackfillCompleted { purged, created }
        }
        CoreEvent::Rescheduled { updated } => EventPayload::Rescheduled { updated },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tenrold starting");

    if tenrol_util::is_mock_time_active() {
        warn!(now = %tenrol_util::now(), "Mock time is active, sweeps use the shifted clock");
    }

    let service = Service::new(&args).await?;
    service.run().await
}
