use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{unbounded, Receiver};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use phishguard_core::commands::{ensure_initialized, ensure_initialized_once, InitReport};
use phishguard_core::domain::VerdictStatus;
use phishguard_core::services::{Message, NavigationRequest, ResourceKind, VerificationOutcome};
use phishguard_core::Engine;

#[derive(Parser, Debug)]
#[command(name = "phishguard-agent")]
#[command(version, about = "Domain access decisions for outgoing navigations", long_about = None)]
struct Cli {
    /// Engine root (config.toml, cache/, logbook/). Defaults to $PHISHGUARD_ROOT or .phishguard
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log filter, e.g. `info` or `phishguard_core=debug`
    #[arg(long, global = true, env = "PHISHGUARD_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the root layout and default config
    Init,

    /// Decide a navigation: ALLOW or REDIRECT to verification
    Gate {
        url: String,
        #[arg(long, value_enum, default_value_t = Kind::MainFrame)]
        kind: Kind,
    },

    /// Ask the classifier about a URL and record an ALLOWED verdict
    Verify { url: String },

    /// Grant a temporary unlock (only lasts as long as this process; see `serve`)
    Unlock { domain: String },

    /// Record a manual verdict for a domain
    Set {
        domain: String,
        #[arg(value_enum)]
        status: StatusArg,
    },

    /// Show cached verdicts
    #[command(alias = "ls")]
    List,

    /// Fetch the authoritative verdict set now
    Refresh,

    /// Dispatch one channel message given as JSON
    Message { json: String },

    /// Long-lived host: one JSON request per stdin line, one JSON reply per stdout line carrying the request `id`
    Serve,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    MainFrame,
    SubFrame,
    Script,
    Image,
    Other,
}

impl From<Kind> for ResourceKind {
    fn from(k: Kind) -> Self {
        match k {
            Kind::MainFrame => ResourceKind::MainFrame,
            Kind::SubFrame => ResourceKind::SubFrame,
            Kind::Script => ResourceKind::Script,
            Kind::Image => ResourceKind::Image,
            Kind::Other => ResourceKind::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Allowed,
    Blocked,
}

impl From<StatusArg> for VerdictStatus {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Allowed => VerdictStatus::Allowed,
            StatusArg::Blocked => VerdictStatus::Blocked,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let report: InitReport = match &cli.root {
        Some(root) => ensure_initialized(root)?,
        None => ensure_initialized_once()?.clone(),
    };
    let root = report.root.clone();

    if let Commands::Init = cli.command {
        print_json(&json!({
            "root": report.root.display().to_string(),
            "created": report.created,
            "existed": report.existed,
        }))?;
        return Ok(());
    }

    let engine = Engine::open(&root).with_context(|| format!("opening engine at {}", root.display()))?;

    match cli.command {
        Commands::Init => {}
        Commands::Gate { url, kind } => {
            let decision = engine.on_navigation(&NavigationRequest {
                requested_url: url,
                resource_kind: kind.into(),
            });
            print_json(&serde_json::to_value(decision)?)?;
        }
        Commands::Verify { url } => {
            let outcome = engine.verify(&url);
            print_outcome(&outcome);
            print_json(&serde_json::to_value(&outcome)?)?;
        }
        Commands::Unlock { domain } => {
            let resp = engine.request_temporary_unlock(&domain);
            print_json(&serde_json::to_value(resp)?)?;
        }
        Commands::Set { domain, status } => {
            let status: VerdictStatus = status.into();
            let resp = engine.handle_message(Message::UpdateCache {
                domain,
                status: i64::from(status.wire_code()),
            });
            print_json(&serde_json::to_value(resp)?)?;
        }
        Commands::List => {
            let verdicts = engine.cache().snapshot();
            if verdicts.is_empty() {
                println!("(cache is empty)");
            }
            for v in verdicts {
                println!("{} — {}", v.domain, popup_label(v.status));
            }
        }
        Commands::Refresh => {
            let outcome = engine.refresh_now();
            print_json(&serde_json::to_value(outcome)?)?;
        }
        Commands::Message { json } => {
            let resp = engine.handle_message_json(&json);
            print_json(&serde_json::to_value(resp)?)?;
        }
        Commands::Serve => serve(&engine)?,
    }

    engine.shutdown();
    Ok(())
}

fn popup_label(status: VerdictStatus) -> &'static str {
    match status {
        VerdictStatus::Allowed => "Whitelisted",
        VerdictStatus::Blocked => "Blocked",
    }
}

fn print_outcome(outcome: &VerificationOutcome) {
    match outcome {
        VerificationOutcome::Allowed { result, proceed_to } => {
            eprintln!(
                "{}: {} ({}) -> proceed to {}",
                result.domain,
                result.prediction,
                result.confidence_display(),
                proceed_to
            );
        }
        VerificationOutcome::Blocked { result, .. } => {
            eprintln!(
                "{}: {} ({})",
                result.domain,
                result.prediction,
                result.confidence_display()
            );
            for r in &result.rationale {
                eprintln!("  - {}", serde_json::to_string(r).unwrap_or_default());
            }
        }
        VerificationOutcome::Failed { original_url, message, .. } => {
            eprintln!("could not verify {original_url}: {message}");
        }
    }
}

fn print_json(v: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(v)?;
    println!("{text}");
    Ok(())
}

// ---------- serve ----------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostCommand {
    Navigate {
        #[serde(rename = "requestedUrl", alias = "url")]
        requested_url: String,
        #[serde(rename = "resourceKind", default)]
        resource_kind: ResourceKind,
    },
    Verify {
        url: String,
    },
    Refresh,
    List,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostRequest {
    Command(HostCommand),
    Message(Message),
}

impl HostRequest {
    /// Requests that wait on the network. These run off the reading thread.
    fn is_slow(&self) -> bool {
        matches!(
            self,
            HostRequest::Command(HostCommand::Verify { .. } | HostCommand::Refresh)
        )
    }
}

/// One decoded input line. `id` is optional and echoed on the reply, so a
/// host can match a verify answer that arrives after later navigations.
struct Envelope {
    id: Option<Value>,
    request: Result<HostRequest>,
}

fn decode(line: &str) -> Envelope {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Envelope {
                id: None,
                request: Err(anyhow!("invalid request: {e}")),
            }
        }
    };
    let id = value.as_object_mut().and_then(|o| o.remove("id"));
    let request = serde_json::from_value(value).map_err(|e| anyhow!("invalid request: {e}"));
    Envelope { id, request }
}

fn reply(id: Option<Value>, result: Result<Value>) -> Value {
    let mut body = result.unwrap_or_else(|e| json!({"success": false, "error": e.to_string()}));
    if let Some(id) = id {
        match body.as_object_mut() {
            Some(obj) => {
                obj.insert("id".into(), id);
            }
            None => body = json!({"id": id, "result": body}),
        }
    }
    body
}

fn serve(engine: &Engine) -> Result<()> {
    engine.start()?;
    tracing::info!(at = %Utc::now().to_rfc3339(), "serving on stdin");
    serve_lines(engine, io::stdin().lock(), io::stdout())
}

/// Navigations and channel messages are answered in order on this thread;
/// verify and refresh run on scoped workers. Every reply goes through one
/// writer so lines never interleave.
fn serve_lines<R, W>(engine: &Engine, input: R, output: W) -> Result<()>
where
    R: BufRead,
    W: Write + Send,
{
    let (tx, rx) = unbounded::<Value>();
    thread::scope(|s| {
        let writer = s.spawn(move || write_replies(rx, output));

        let read = (|| -> Result<()> {
            for line in input.lines() {
                let line = line.context("reading stdin")?;
                if line.trim().is_empty() {
                    continue;
                }
                let Envelope { id, request } = decode(&line);
                match request {
                    Ok(req) if req.is_slow() => {
                        let tx = tx.clone();
                        s.spawn(move || {
                            let _ = tx.send(reply(id, answer(engine, req)));
                        });
                    }
                    other => {
                        let _ = tx.send(reply(id, other.and_then(|req| answer(engine, req))));
                    }
                }
            }
            Ok(())
        })();
        drop(tx);

        let written = writer
            .join()
            .map_err(|_| anyhow!("reply writer panicked"))?;
        read.and(written)
    })
}

fn write_replies<W: Write>(replies: Receiver<Value>, mut out: W) -> Result<()> {
    for reply in replies {
        serde_json::to_writer(&mut out, &reply)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

fn answer(engine: &Engine, req: HostRequest) -> Result<Value> {
    let value = match req {
        HostRequest::Command(HostCommand::Navigate {
            requested_url,
            resource_kind,
        }) => serde_json::to_value(engine.on_navigation(&NavigationRequest {
            requested_url,
            resource_kind,
        }))?,
        HostRequest::Command(HostCommand::Verify { url }) => {
            // Accept either the original URL or the redirect target carrying it.
            let original = engine.original_url_of(&url).unwrap_or(url);
            serde_json::to_value(engine.verify(&original))?
        }
        HostRequest::Command(HostCommand::Refresh) => serde_json::to_value(engine.refresh_now())?,
        HostRequest::Command(HostCommand::List) => {
            let entries: Vec<Value> = engine
                .cache()
                .snapshot()
                .into_iter()
                .map(|v| json!({"domain": v.domain, "status": v.status, "source": v.source}))
                .collect();
            json!({ "entries": entries })
        }
        HostRequest::Message(m) => serde_json::to_value(engine.handle_message(m))?,
    };
    Ok(value)
}
