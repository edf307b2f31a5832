//! # Tandem Workout
//!
//! A workout tracker CLI built on the Tandem SDK. Schedules hold exercises,
//! exercises hold sets, and all of it can be recorded without a network:
//!
//! ```text
//! POST /schedules                          -> schedule id
//! POST /schedules/{schedule_id}/exercises  -> exercise id
//! POST /exercises/{exercise_id}/sets       -> set id
//! ```
//!
//! Each scenario runs against an in-memory backend that fails with 500 when a
//! child arrives before its parent, which is how the original incident
//! looked from the server side.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use serde_json::json;
use tandem_sdk::prelude::*;
use tandem_sdk::{DrainReport, Fault, Priority};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tandem-workout")]
#[command(about = "Offline-first workout tracker (Tandem SDK)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule, exercise and set recorded offline, then synced in order
    Incident,
    /// An unsynced exercise is deleted before anything is sent
    Cascade,
    /// The server processes a create but the response is lost
    Replay,
    /// Token expiry, server errors and a restart in the middle of a session
    Outage {
        /// Where to keep the sync state between the two halves of the run
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Interactive REPL for manual experimentation
    Interactive,
}

// ─── Setup ─────────────────────────────────────────────────────────────────

fn workout_routes() -> ResourceRegistry {
    ResourceRegistry::new()
        .with(ResourceSpec::new("schedules", "/schedules").with_priority(Priority::High))
        .with(ResourceSpec::new("exercises", "/schedules/{schedule_id}/exercises"))
        .with(ResourceSpec::new("sets", "/exercises/{exercise_id}/sets"))
}

fn demo_config() -> SyncConfigBuilder {
    SyncConfigBuilder::new().auto_sync(false).backoff(10, 200)
}

async fn open_session(
    backend: &Arc<MemoryBackend>,
    tokens: Arc<StaticToken>,
    config: SyncConfig,
) -> Result<Session, SdkError> {
    Session::open(config, workout_routes(), backend.clone(), tokens).await
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn warn(text: &str) {
    println!("  {} {}", "!".bright_red(), text);
}

fn show_report(report: &DrainReport) {
    println!(
        "  {} sent {}  acked {}  replayed {}  retrying {}  failed {}  pending {}{}",
        "⇅".bright_cyan(),
        report.sent,
        report.acknowledged.to_string().bright_green(),
        report.duplicates,
        report.retrying.to_string().bright_yellow(),
        report.failed.to_string().bright_red(),
        report.pending,
        if report.halted {
            "  (halted)".bright_red().to_string()
        } else {
            String::new()
        }
    );
}

fn show_wire(backend: &MemoryBackend) {
    let border = "─".repeat(56);
    println!("  ┌{}┐", border);
    let requests = backend.requests();
    if requests.is_empty() {
        println!("  │ {:^54} │", "(no requests)".dimmed().to_string());
    }
    for request in requests {
        let line = format!("{:<6} {}", request.method.to_string(), request.url);
        println!("  │ {:<54} │", line);
    }
    println!("  └{}┘", border);
}

fn show_entity(session: &Session, label: &str, id: &LocalId) {
    match session.get(id) {
        Some(record) => {
            let remote = record
                .remote_id()
                .map(|remote| remote.to_string())
                .unwrap_or_else(|| "-".to_string());
            let status = match record.sync_status {
                SyncStatus::Synced => "synced".bright_green(),
                SyncStatus::Pending => "pending".bright_yellow(),
                SyncStatus::Deleted => "deleted".bright_red(),
            };
            step(&format!("{:<10} {} remote={} [{}]", label, id, remote.bright_magenta(), status));
        }
        None => step(&format!("{:<10} {} {}", label, id, "(purged)".dimmed())),
    }
}

fn verdict(ok: bool, pass: &str, fail: &str) {
    if ok {
        println!("\n  {} {}", "✓".bright_green().bold(), pass.bright_green().bold());
    } else {
        println!("\n  {} {}", "✗".bright_red().bold(), fail.bright_red().bold());
    }
}

/// Record a schedule, one exercise and one set.
fn record_workout(session: &Session) -> Result<(LocalId, LocalId, LocalId), SdkError> {
    let schedule = session.create("schedules", json!({"name": "Push day"}), &[])?;
    step("schedule 'Push day' created locally");
    let exercise = session.create(
        "exercises",
        json!({"name": "Bench press"}),
        &[("schedule_id", schedule)],
    )?;
    step("exercise 'Bench press' created under it");
    let set = session.create(
        "sets",
        json!({"reps": 5, "weight": 80}),
        &[("exercise_id", exercise)],
    )?;
    step("set 5 x 80kg created under the exercise");
    Ok((schedule, exercise, set))
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

async fn run_incident() -> Result<(), SdkError> {
    header("INCIDENT — Parent/Child Creation Race");

    let backend = Arc::new(MemoryBackend::new());
    backend.set_offline(true);
    let session = open_session(&backend, Arc::new(StaticToken::new("demo")), demo_config().build()).await?;

    section("Phase 1: Offline, the whole workout is recorded");
    let (schedule, exercise, set) = record_workout(&session)?;
    step(&format!("{} items waiting in the outbox", session.pending_count()));

    section("Phase 2: Back online");
    backend.set_offline(false);
    let report = session.sync_now().await?;
    show_report(&report);
    show_wire(&backend);

    section("Phase 3: Local state");
    show_entity(&session, "schedule", &schedule);
    show_entity(&session, "exercise", &exercise);
    show_entity(&session, "set", &set);

    verdict(
        report.failed == 0 && backend.live_count() == 3,
        "Children were sent only after their parents had server ids",
        "A child reached the server before its parent",
    );
    session.close().await
}

async fn run_cascade() -> Result<(), SdkError> {
    header("CASCADE — Deleting Work the Server Never Saw");

    let backend = Arc::new(MemoryBackend::new());
    backend.set_offline(true);
    let session = open_session(&backend, Arc::new(StaticToken::new("demo")), demo_config().build()).await?;

    section("Phase 1: Offline recording");
    let (schedule, exercise, set) = record_workout(&session)?;

    section("Phase 2: The exercise is deleted before any sync");
    let report = session.delete(&exercise)?;
    step(&format!(
        "purged {} entities, cancelled {} outbox items",
        report.purged.len(),
        report.cancelled.len()
    ));

    section("Phase 3: Back online");
    backend.set_offline(false);
    show_report(&session.sync_now().await?);
    show_wire(&backend);
    show_entity(&session, "schedule", &schedule);
    show_entity(&session, "exercise", &exercise);
    show_entity(&session, "set", &set);

    verdict(
        backend.request_count() == 1,
        "Only the schedule went out; nothing was sent for the deleted subtree",
        "Requests were sent for deleted entities",
    );
    session.close().await
}

async fn run_replay() -> Result<(), SdkError> {
    header("REPLAY — Processed, Then Timed Out");

    let backend = Arc::new(MemoryBackend::new());
    let session = open_session(&backend, Arc::new(StaticToken::new("demo")), demo_config().build()).await?;

    section("Phase 1: The response to the create is lost");
    let schedule = session.create("schedules", json!({"name": "Leg day"}), &[])?;
    backend.inject(Fault::ProcessedThenTimeout);
    show_report(&session.sync_now().await?);
    step(&format!(
        "server holds {} schedule(s), client still pending",
        backend.records_in("/schedules").len()
    ));

    section("Phase 2: Redelivery with the same correlation id");
    tokio::time::sleep(Duration::from_millis(50)).await;
    show_report(&session.sync_now().await?);
    show_wire(&backend);
    show_entity(&session, "schedule", &schedule);

    let on_server = backend.records_in("/schedules");
    let matches = session
        .get(&schedule)
        .and_then(|record| record.remote_id().cloned())
        .map_or(false, |remote| on_server.len() == 1 && on_server[0].id == remote.as_str());
    verdict(
        matches,
        "One server record, and the client adopted its id",
        "The create was duplicated",
    );
    session.close().await
}

async fn run_outage(state: Option<PathBuf>) -> Result<(), SdkError> {
    header("OUTAGE — Expired Token, Flaky Server, Restart");

    let dir = std::env::temp_dir().join("tandem-workout");
    let state = state.unwrap_or_else(|| dir.join("state.json"));
    if let Some(parent) = state.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SdkError::Store(e.into()))?;
    }
    let _ = std::fs::remove_file(&state);

    let backend = Arc::new(MemoryBackend::new());
    backend.require_token("fresh");
    let tokens = Arc::new(StaticToken::new("expired"));
    let config = demo_config().persist_to(&state).build();

    section("Phase 1: Recording with an expired token");
    let session = open_session(&backend, tokens.clone(), config.clone()).await?;
    let mut events = session.subscribe();
    let (schedule, exercise, set) = record_workout(&session)?;
    show_report(&session.sync_now().await?);
    while let Ok(event) = events.try_recv() {
        if event == SyncEvent::AuthRequired {
            warn("backend rejected the token; dispatch halted");
        }
    }

    section("Phase 2: App restarts before the user signs back in");
    session.close().await?;
    step(&format!("state written to {}", state.display()));
    let session = open_session(&backend, tokens.clone(), config).await?;
    step(&format!("reloaded with {} pending items", session.pending_count()));

    section("Phase 3: Signed in again, but the server is struggling");
    tokens.set("fresh");
    session.resume_after_reauth();
    backend.inject(Fault::Status(503));
    backend.inject(Fault::Timeout);
    for _ in 0..4 {
        let report = session.sync_now().await?;
        show_report(&report);
        if report.pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    show_wire(&backend);
    show_entity(&session, "schedule", &schedule);
    show_entity(&session, "exercise", &exercise);
    show_entity(&session, "set", &set);

    verdict(
        session.pending_count() == 0 && session.failed_count() == 0 && backend.live_count() == 3,
        "Everything recorded offline made it to the server exactly once",
        "Some items are still pending or failed",
    );
    session.close().await
}

// ─── Interactive REPL ──────────────────────────────────────────────────────

struct Repl {
    backend: Arc<MemoryBackend>,
    session: Session,
    entities: Vec<(String, LocalId)>,
}

impl Repl {
    fn entity(&self, index: &str) -> Option<LocalId> {
        let index: usize = index.parse().ok()?;
        self.entities.get(index.checked_sub(1)?).map(|(_, id)| *id)
    }

    fn remember(&mut self, label: String, id: LocalId) {
        self.entities.push((label, id));
        step(&format!("#{} {}", self.entities.len(), self.entities[self.entities.len() - 1].0));
    }

    fn list(&self) {
        for (i, (label, id)) in self.entities.iter().enumerate() {
            show_entity(&self.session, &format!("#{} {}", i + 1, label), id);
        }
        step(&format!(
            "pending {}  failed {}  network {}",
            self.session.pending_count(),
            self.session.failed_count(),
            if self.backend.is_offline() {
                "offline".bright_red()
            } else {
                "online".bright_green()
            }
        ));
    }

    async fn handle(&mut self, parts: &[&str]) -> Result<(), SdkError> {
        match parts {
            ["schedule", name @ ..] if !name.is_empty() => {
                let name = name.join(" ");
                let id = self.session.create("schedules", json!({ "name": name }), &[])?;
                self.remember(format!("schedule '{}'", name), id);
            }
            ["exercise", parent, name @ ..] if !name.is_empty() => {
                let Some(parent) = self.entity(parent) else {
                    warn("no such entity");
                    return Ok(());
                };
                let name = name.join(" ");
                let id = self
                    .session
                    .create("exercises", json!({ "name": name }), &[("schedule_id", parent)])?;
                self.remember(format!("exercise '{}'", name), id);
            }
            ["set", parent, reps, weight] => {
                let (Some(parent), Ok(reps), Ok(weight)) =
                    (self.entity(parent), reps.parse::<u32>(), weight.parse::<f64>())
                else {
                    warn("usage: set <exercise#> <reps> <weight>");
                    return Ok(());
                };
                let id = self.session.create(
                    "sets",
                    json!({ "reps": reps, "weight": weight }),
                    &[("exercise_id", parent)],
                )?;
                self.remember(format!("set {} x {}", reps, weight), id);
            }
            ["rename", target, name @ ..] if !name.is_empty() => match self.entity(target) {
                Some(id) => {
                    self.session.update(&id, json!({ "name": name.join(" ") }))?;
                    step("updated");
                }
                None => warn("no such entity"),
            },
            ["delete", target] => match self.entity(target) {
                Some(id) => {
                    let report = self.session.delete(&id)?;
                    step(&format!(
                        "purged {}  tombstoned {}  cancelled {}",
                        report.purged.len(),
                        report.tombstoned.len(),
                        report.cancelled.len()
                    ));
                }
                None => warn("no such entity"),
            },
            ["offline"] => {
                self.backend.set_offline(true);
                step("network down");
            }
            ["online"] => {
                self.backend.set_offline(false);
                step("network up");
            }
            ["fail", status] => match status.parse::<u16>() {
                Ok(status) => {
                    self.backend.inject(Fault::Status(status));
                    step(&format!("next request answers {}", status));
                }
                Err(_) => warn("usage: fail <status>"),
            },
            ["sync"] => show_report(&self.session.sync_now().await?),
            ["list"] | ["ls"] => self.list(),
            ["wire"] => show_wire(&self.backend),
            ["failed"] => {
                for item in self.session.failed_items() {
                    step(&format!(
                        "{} {} {} ({})",
                        item.id,
                        item.method,
                        item.url_template,
                        item.last_error.as_deref().unwrap_or("no error recorded")
                    ));
                }
            }
            ["retry"] => {
                for item in self.session.failed_items() {
                    self.session.retry_failed(&item.id)?;
                }
                step("failed items queued again");
            }
            ["help"] => print_help(),
            [other, ..] => {
                println!("  {} Unknown command '{}' — type 'help'", "?".bright_yellow(), other);
            }
            [] => {}
        }
        Ok(())
    }
}

fn print_help() {
    println!();
    println!("  {}", "Commands:".bold().underline());
    let commands = [
        ("schedule <name>", "Record a schedule"),
        ("exercise <#> <name>", "Record an exercise under schedule #"),
        ("set <#> <reps> <weight>", "Record a set under exercise #"),
        ("rename <#> <name>", "Rename an entity"),
        ("delete <#>", "Delete an entity and everything below it"),
        ("offline | online", "Toggle the network"),
        ("fail <status>", "Make the next request fail with <status>"),
        ("sync", "Drain the outbox now"),
        ("list", "Show local entities and counters"),
        ("wire", "Show every request the server received"),
        ("failed | retry", "Inspect or requeue failed items"),
        ("quit", "Exit"),
    ];
    for (usage, about) in commands {
        println!("    {:<26} {}", usage.bright_cyan(), about);
    }
    println!();
}

async fn run_interactive() -> Result<(), SdkError> {
    header("INTERACTIVE REPL — Tandem Workout Tracker");

    let backend = Arc::new(MemoryBackend::new());
    let session = open_session(&backend, Arc::new(StaticToken::new("demo")), demo_config().build()).await?;
    let mut repl = Repl {
        backend,
        session,
        entities: Vec::new(),
    };
    print_help();

    loop {
        print!("{}", "tandem> ".bright_cyan().bold());
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() || input.is_empty() {
            break;
        }
        let parts: Vec<&str> = input.split_whitespace().collect();
        if matches!(parts.as_slice(), ["quit"] | ["exit"] | ["q"]) {
            break;
        }
        if let Err(e) = repl.handle(&parts).await {
            warn(&e.to_string());
        }
    }
    repl.session.close().await
}

// ─── Entry point ───────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Incident => run_incident().await,
        Commands::Cascade => run_cascade().await,
        Commands::Replay => run_replay().await,
        Commands::Outage { state } => run_outage(state).await,
        Commands::Interactive => run_interactive().await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}
