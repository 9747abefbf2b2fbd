//! tenrolctl - Command-line control for tenrold
//!
//! Sends a single command over the IPC socket and prints the result.
//! `watch` keeps the connection open and prints events as they arrive.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use tenrol_api::{Command, Event, EventPayload, ResponsePayload, RoleAssigned, RoleUnassigned};
use tenrol_ipc::IpcClient;
use tenrol_util::{
    default_socket_path, format_unix, ContextId, CourseId, RoleAssignmentId, RoleId, UserId,
};

#[derive(Parser, Debug)]
#[command(name = "tenrolctl")]
#[command(about = "Control and inspect a running tenrold", long_about = None)]
struct Args {
    /// Socket path (or set TENROL_SOCKET env var)
    #[arg(short, long, default_value_os_t = default_socket_path())]
    socket: PathBuf,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Check that the daemon answers
    Ping,
    /// Show service health
    Health,
    /// List tracked temporary enrolments
    List,
    /// Run the expiration sweep now
    Expire,
    /// Run the reminder sweep now
    Remind,
    /// Purge stale records and adopt existing marker assignments
    Backfill,
    /// Reload the configuration file
    Reload,
    /// Print events until interrupted
    Watch,
    /// Deliver a role-assigned event
    Assigned(RoleChange),
    /// Deliver a role-unassigned event
    Unassigned(RoleChange),
}

#[derive(ClapArgs, Debug)]
struct RoleChange {
    /// User who made the change
    #[arg(long)]
    actor: i64,
    /// User whose role changed
    #[arg(long)]
    user: i64,
    #[arg(long)]
    context: i64,
    #[arg(long)]
    course: i64,
    #[arg(long)]
    role: i64,
    /// Role assignment id
    #[arg(long)]
    assignment: i64,
    /// Unix seconds (default: now)
    #[arg(long)]
    timestamp: Option<i64>,
}

impl RoleChange {
    fn assigned(&self) -> RoleAssigned {
        RoleAssigned {
            actor_id: UserId::new(self.actor),
            subject_id: UserId::new(self.user),
            context_id: ContextId::new(self.context),
            course_id: CourseId::new(self.course),
            role_id: RoleId::new(self.role),
            role_assignment_id: RoleAssignmentId::new(self.assignment),
            timestamp: self.timestamp.unwrap_or_else(tenrol_util::unix_now),
        }
    }

    fn unassigned(&self) -> RoleUnassigned {
        let ev = self.assigned();
        RoleUnassigned {
            actor_id: ev.actor_id,
            subject_id: ev.subject_id,
            context_id: ev.context_id,
            course_id: ev.course_id,
            role_id: ev.role_id,
            role_assignment_id: ev.role_assignment_id,
            timestamp: ev.timestamp,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut client = IpcClient::connect(&args.socket)
        .await
        .with_context(|| format!("Failed to connect to tenrold at {:?}", args.socket))?;

    let command = match &args.command {
        Action::Watch => return watch(client, args.json).await,
        Action::Ping => Command::Ping,
        Action::Health => Command::GetHealth,
        Action::List => Command::ListTracking,
        Action::Expire => Command::RunExpirationSweep,
        Action::Remind => Command::RunReminderSweep,
        Action::Backfill => Command::RunBackfill,
        Action::Reload => Command::ReloadConfig,
        Action::Assigned(change) => Command::RoleAssigned(change.assigned()),
        Action::Unassigned(change) => Command::RoleUnassigned(change.unassigned()),
    };

    let payload = client.call(command).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_payload(&payload);
    }

    Ok(())
}

async fn watch(client: IpcClient, json: bool) -> Result<()> {
    let mut events = client.subscribe().await?;

    loop {
        let event = events.next().await?;
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }
}

fn print_payload(payload: &ResponsePayload) {
    match payload {
        ResponsePayload::Pong => println!("pong"),
        ResponsePayload::Handled { changes } => println!("Handled ({} changes)", changes),
        ResponsePayload::SweepCompleted { processed } => {
            println!("Sweep completed ({} processed)", processed)
        }
        ResponsePayload::BackfillCompleted { purged, created } => {
            println!("Backfill completed ({} purged, {} created)", purged, created)
        }
        ResponsePayload::ConfigReloaded => println!("Configuration reloaded"),
        ResponsePayload::Tracking(views) => {
            if views.is_empty() {
                println!("No tracked enrolments");
                return;
            }
            println!(
                "{:>10} {:>6} {:<20} {:<20} {:>9} {:<8}",
                "ASSIGNMENT", "ROLE", "START", "END", "DAYS LEFT", "UPGRADED"
            );
            for view in views {
                println!(
                    "{:>10} {:>6} {:<20} {:<20} {:>9} {:<8}",
                    view.role_assignment_id,
                    view.role_id,
                    format_unix(view.time_start),
                    format_unix(view.time_end),
                    view.days_left,
                    if view.upgraded { "yes" } else { "no" }
                );
            }
        }
        ResponsePayload::Health(health) => {
            println!("Live:          {}", health.live);
            println!("Ready:         {}", health.ready);
            println!("Store:         {}", ok(health.store_healthy));
            println!("Host:          {}", ok(health.host_healthy));
            println!("Enabled:       {}", health.enabled);
            match health.marker_role_id {
                Some(role) => println!("Marker role:   {}", role),
                None => println!("Marker role:   (inactive)"),
            }
            println!("Tracked:       {}", health.tracked_count);
        }
        ResponsePayload::Subscribed { client_id } => println!("Subscribed as {}", client_id),
        ResponsePayload::Unsubscribed => println!("Unsubscribed"),
    }
}

fn ok(healthy: bool) -> &'static str {
    if healthy { "ok" } else { "FAILING" }
}

fn print_event(event: &Event) {
    let at = event.timestamp.format("%Y-%m-%d %H:%M:%S");
    match &event.payload {
        EventPayload::TrackingStarted {
            role_assignment_id,
            user_id,
            time_end,
        } => println!(
            "{} tracking started: assignment {} user {} until {}",
            at,
            role_assignment_id,
            user_id,
            format_unix(*time_end)
        ),
        EventPayload::AssignmentRejected {
            user_id,
            context_id,
        } => println!(
            "{} rejected: user {} already holds a role in context {}",
            at, user_id, context_id
        ),
        EventPayload::Upgraded {
            role_assignment_id,
            user_id,
        } => println!(
            "{} upgraded: assignment {} user {}",
            at, role_assignment_id, user_id
        ),
        EventPayload::Expired {
            role_assignment_id,
            user_id,
        } => println!(
            "{} expired: assignment {} user {}",
            at, role_assignment_id, user_id
        ),
        EventPayload::Unenrolled { user_id, course_id } => {
            println!("{} unenrolled: user {} from course {}", at, user_id, course_id)
        }
        EventPayload::EmailSent { kind, to } => println!("{} email {} sent to user {}", at, kind, to),
        EventPayload::BackfillCompleted { purged, created } => println!(
            "{} backfill: {} purged, {} created",
            at, purged, created
        ),
        EventPayload::Rescheduled { updated } => {
            println!("{} rescheduled: {} end times updated", at, updated)
        }
        EventPayload::ConfigReloaded => println!("{} configuration reloaded", at),
    }
}
