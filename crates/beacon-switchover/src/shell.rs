//! Interactive switchover shell.
//!
//! The shell is a thin operator console: every state-changing command is a
//! coordination-bus message the current leader acts on (or refuses). The
//! shell holds no authority of its own; killing it mid-switchover changes
//! nothing about the cluster. A background refresher keeps a fleet snapshot
//! warm so `status` renders instantly.

use crate::bus::Bus;
use crate::message::{Message, MessageKind};
use crate::store::{elect_leader, ClusterStore, NodeRow};
use crate::sync::apply;
use crate::{Phase, SwitchoverResult};
use chrono::Utc;
use sqlx::PgPool;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

const HELP: &str = "\
commands:
  status    show cluster phase, per-node state, and sync lag
  enable    begin a switchover attempt (install capture, start sync)
  sync      re-check sync health after a stall
  pause     pause bulk copy
  resume    resume bulk copy
  execute   freeze the fleet and flip to the next database
  abort     abandon the attempt; the old database stays authoritative
  reset     clear a finished/aborted attempt back to idle
  help      this text
  exit      leave the shell (the cluster is unaffected)";

/// Point-in-time fleet view for rendering.
#[derive(Debug, Clone, Default)]
struct FleetView {
    phase: Option<(Phase, i64)>,
    nodes: Vec<NodeRow>,
    lag: Option<i64>,
    error: Option<String>,
}

/// Run the interactive shell until `exit` or EOF.
pub async fn run_shell(old: PgPool, next: PgPool) -> SwitchoverResult<()> {
    let store = ClusterStore::new(old.clone());
    store.ensure_schema().await?;
    let bus = Bus::new(old.clone());
    let sender = Uuid::new_v4();

    let view = Arc::new(parking_lot::RwLock::new(FleetView::default()));
    let refresher = {
        let view = Arc::clone(&view);
        let store = store.clone();
        let old = old.clone();
        let next = next.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let mut fresh = FleetView::default();
                match store.phase().await {
                    Ok(phase) => fresh.phase = Some(phase),
                    Err(err) => fresh.error = Some(err.to_string()),
                }
                if let Ok(nodes) = store.nodes().await {
                    fresh.nodes = nodes;
                }
                // Lag is best-effort: before attach there is no change log
                // or cursor to measure.
                fresh.lag = apply::lag(&old, &next).await.ok();
                *view.write() = fresh;
            }
        })
    };

    println!("beacon switchover shell (type 'help' for commands)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("switchover> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.map_err(|err| anyhow::anyhow!(err))? else {
            break;
        };
        let command = line.trim();
        match command {
            "" => {}
            "help" | "?" => println!("{HELP}"),
            "exit" | "quit" => break,
            "status" => render_status(&view.read()),
            "enable" => send_command(&bus, &store, sender, MessageKind::Enable).await,
            "sync" => send_command(&bus, &store, sender, MessageKind::Sync).await,
            "pause" => send_command(&bus, &store, sender, MessageKind::Pause).await,
            "resume" => send_command(&bus, &store, sender, MessageKind::Resume).await,
            "execute" => {
                let ready = view
                    .read()
                    .phase
                    .map(|(phase, _)| phase == Phase::Ready)
                    .unwrap_or(false);
                if !ready {
                    println!("refused: cluster is not in 'ready' (try 'status')");
                    continue;
                }
                send_command(&bus, &store, sender, MessageKind::Execute).await;
            }
            "abort" => send_command(&bus, &store, sender, MessageKind::Abort).await,
            "reset" => send_command(&bus, &store, sender, MessageKind::Reset).await,
            other => println!("unknown command {other:?}; type 'help'"),
        }
    }

    refresher.abort();
    Ok(())
}

/// Stamp the command with the cluster's current phase/version and publish.
/// The leader fences on the stamp, so a stale shell view is harmless.
async fn send_command(bus: &Bus, store: &ClusterStore, sender: Uuid, kind: MessageKind) {
    let (phase, version) = match store.phase().await {
        Ok(current) => current,
        Err(err) => {
            println!("cannot read cluster state: {err}");
            return;
        }
    };
    match bus.send(&Message::new(sender, kind, phase, version)).await {
        Ok(()) => println!("sent ({phase}, v{version})"),
        Err(err) => println!("send failed: {err}"),
    }
}

fn render_status(view: &FleetView) {
    match &view.phase {
        Some((phase, version)) => println!("cluster: {phase} (version {version})"),
        None => println!("cluster: unknown{}", match &view.error {
            Some(err) => format!(" ({err})"),
            None => String::new(),
        }),
    }
    match view.lag {
        Some(lag) => println!("sync lag: {lag}"),
        None => println!("sync lag: n/a (not attached)"),
    }

    if view.nodes.is_empty() {
        println!("no live nodes registered");
        return;
    }
    let now = Utc::now();
    let leader = elect_leader(&view.nodes, now);
    println!("{:<38} {:<9} {:<12} leader", "node", "status", "heartbeat");
    for node in &view.nodes {
        let age = now
            .signed_duration_since(node.last_heartbeat)
            .num_milliseconds() as f64
            / 1000.0;
        let mark = if leader == Some(node.node_id) { "*" } else { "" };
        let liveness = if node.is_live(now) { format!("{age:.1}s ago") } else { "DEAD".into() };
        println!(
            "{:<38} {:<9} {:<12} {}",
            node.name,
            node.status().as_str(),
            liveness,
            mark
        );
    }
}
