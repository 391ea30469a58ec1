use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use stash::{BackendConfig, Bucket, Connection, Event, SetOption, StashConfig};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    tracing::debug!(?config, "resolved configuration");
    let conn = stash::open(&config)
        .await
        .with_context(|| format!("cannot open {} store", config.backend.name()))?;

    let result = dispatch(&conn, cli.command, cli.format).await;
    conn.close().await?;
    result
}

async fn dispatch(conn: &Connection, command: Command, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Command::Get(args) => cmd_get(conn, args, format).await,
        Command::Set(args) => cmd_set(conn, args, format).await,
        Command::Delete(args) => cmd_delete(conn, args, format).await,
        Command::Exists(args) => cmd_exists(conn, args, format).await,
        Command::Keys(args) => cmd_keys(conn, args, format).await,
        Command::Len(args) => cmd_len(conn, args, format).await,
        Command::Dump(args) => cmd_dump(conn, args).await,
        Command::Watch(args) => cmd_watch(conn, args, format).await,
    }
}

/// Configuration file first, then command-line overrides.
///
/// `--path` alone selects the json backend and `--endpoint` alone selects
/// etcd. Settings of a backend survive when the flags pick the same kind.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<StashConfig> {
    let mut config = match &cli.config {
        Some(path) => StashConfig::load(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?,
        None => StashConfig::default(),
    };

    let kind = cli.backend.or_else(|| {
        if cli.path.is_some() {
            Some(BackendKind::Json)
        } else if !cli.endpoints.is_empty() {
            Some(BackendKind::Etcd)
        } else {
            None
        }
    });

    let current = std::mem::take(&mut config.backend);
    config.backend = match (kind, current) {
        (None, current) => current,
        (Some(BackendKind::Memory), current @ BackendConfig::Memory { .. }) => current,
        (Some(BackendKind::Memory), _) => BackendConfig::default(),
        (
            Some(BackendKind::Json),
            BackendConfig::Json {
                path,
                sync_interval_ms,
            },
        ) => BackendConfig::Json {
            path: cli.path.clone().unwrap_or(path),
            sync_interval_ms,
        },
        (Some(BackendKind::Json), _) => BackendConfig::Json {
            path: cli.path.clone().context("the json backend needs --path")?,
            sync_interval_ms: None,
        },
        (
            Some(BackendKind::Etcd),
            BackendConfig::Etcd {
                endpoints,
                request_timeout_ms,
                node,
            },
        ) => BackendConfig::Etcd {
            endpoints: if cli.endpoints.is_empty() {
                endpoints
            } else {
                cli.endpoints.clone()
            },
            request_timeout_ms,
            node,
        },
        (Some(BackendKind::Etcd), _) => {
            anyhow::ensure!(
                !cli.endpoints.is_empty(),
                "the etcd backend needs at least one --endpoint"
            );
            BackendConfig::Etcd {
                endpoints: cli.endpoints.clone(),
                request_timeout_ms: None,
                node: None,
            }
        }
    };
    Ok(config)
}

/// Command-line values are JSON; anything that does not parse is a string.
pub fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Where a command operates: the whole store or one bucket of it.
struct Scope<'a> {
    conn: &'a Connection,
    bucket: Option<Bucket>,
}

impl<'a> Scope<'a> {
    fn new(conn: &'a Connection, path: &[String]) -> anyhow::Result<Self> {
        let bucket = if path.is_empty() {
            None
        } else {
            Some(conn.bucket(path)?)
        };
        Ok(Self { conn, bucket })
    }

    fn key(&self, key: &str) -> anyhow::Result<String> {
        match &self.bucket {
            Some(bucket) => Ok(bucket.full_key(key)?),
            None => Ok(key.to_string()),
        }
    }

    fn prefix(&self, prefix: &str) -> String {
        match &self.bucket {
            Some(bucket) => format!("{}{prefix}", bucket.scan_prefix()),
            None => prefix.to_string(),
        }
    }

    /// `full` as the user addressed it.
    fn display(&self, full: &str) -> String {
        let Some(bucket) = &self.bucket else {
            return full.to_string();
        };
        self.conn
            .coder()
            .keys()
            .strip_bucket(bucket.prefix(), full)
            .unwrap_or(full)
            .to_string()
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_get(conn: &Connection, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let key = scope.key(&args.key)?;
    if args.raw {
        let bytes = conn.get_raw(&key).await?;
        match format {
            OutputFormat::Text => println!("{}", hex::encode(bytes)),
            OutputFormat::Json => print_json(&json!({ "key": args.key, "raw": hex::encode(bytes) }))?,
        }
        return Ok(());
    }
    let value: Value = conn.get(&key).await?;
    match format {
        OutputFormat::Text => print_json(&value),
        OutputFormat::Json => print_json(&json!({ "key": args.key, "value": value })),
    }
}

async fn cmd_set(conn: &Connection, args: SetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let value = parse_value(&args.value);
    let options: Vec<SetOption> = args
        .ttl_ms
        .map(|ms| SetOption::Ttl(Duration::from_millis(ms)))
        .into_iter()
        .collect();
    conn.set(&scope.key(&args.key)?, &value, &options).await?;
    match format {
        OutputFormat::Text => println!("{} Stored {}", "✓".green().bold(), args.key.yellow()),
        OutputFormat::Json => print_json(&json!({ "key": args.key, "stored": true }))?,
    }
    Ok(())
}

async fn cmd_delete(conn: &Connection, args: KeyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    conn.delete(&scope.key(&args.key)?).await?;
    match format {
        OutputFormat::Text => println!("{} Deleted {}", "✓".green().bold(), args.key.yellow()),
        OutputFormat::Json => print_json(&json!({ "key": args.key, "deleted": true }))?,
    }
    Ok(())
}

async fn cmd_exists(conn: &Connection, args: KeyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let exists = conn.exists(&scope.key(&args.key)?).await?;
    match format {
        OutputFormat::Text if exists => println!("{} {}", args.key.yellow(), "exists".green()),
        OutputFormat::Text => println!("{} {}", args.key.yellow(), "does not exist".red()),
        OutputFormat::Json => print_json(&json!({ "key": args.key, "exists": exists }))?,
    }
    Ok(())
}

async fn cmd_keys(conn: &Connection, args: PrefixArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let keys: Vec<String> = conn
        .keys(&scope.prefix(&args.prefix))
        .await?
        .iter()
        .map(|k| scope.display(k))
        .collect();
    match format {
        OutputFormat::Text => {
            for key in &keys {
                println!("{key}");
            }
            Ok(())
        }
        OutputFormat::Json => print_json(&json!(keys)),
    }
}

async fn cmd_len(conn: &Connection, args: PrefixArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let len = conn.len(&scope.prefix(&args.prefix)).await?;
    match format {
        OutputFormat::Text => println!("{len}"),
        OutputFormat::Json => print_json(&json!({ "prefix": args.prefix, "len": len }))?,
    }
    Ok(())
}

async fn cmd_dump(conn: &Connection, args: PrefixArgs) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let dump = conn.dump(&scope.prefix(&args.prefix)).await?;
    let shown: serde_json::Map<String, Value> = dump
        .into_iter()
        .map(|(k, v)| (scope.display(&k), v))
        .collect();
    print_json(&Value::Object(shown))
}

async fn cmd_watch(conn: &Connection, args: WatchArgs, format: OutputFormat) -> anyhow::Result<()> {
    let scope = Scope::new(conn, &args.bucket)?;
    let cancel = CancellationToken::new();
    let mut events = conn
        .watch::<Value>(&cancel, &scope.prefix(&args.prefix))
        .await?;
    if format == OutputFormat::Text {
        eprintln!("Watching {} (Ctrl-C to stop)", args.prefix.bold());
    }

    let mut seen = 0;
    while args.count.map_or(true, |limit| seen < limit) {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else { break };
        seen += 1;
        match format {
            OutputFormat::Text => print_event_text(&scope, &event),
            OutputFormat::Json => println!("{}", event_json(&scope, &event)),
        }
    }
    cancel.cancel();
    Ok(())
}

fn print_event_text(scope: &Scope<'_>, event: &Event<Value>) {
    let key = scope.display(event.key());
    match event {
        Event::Put { value, .. } => println!("{} {} {}", "PUT".green().bold(), key.yellow(), value),
        Event::Delete { .. } => println!("{} {}", "DELETE".red().bold(), key.yellow()),
        Event::Error { message, .. } => {
            println!("{} {} {}", "ERROR".magenta().bold(), key.yellow(), message)
        }
    }
}

fn event_json(scope: &Scope<'_>, event: &Event<Value>) -> Value {
    let key = scope.display(event.key());
    match event {
        Event::Put { value, .. } => json!({ "type": "put", "key": key, "value": value }),
        Event::Delete { .. } => json!({ "type": "delete", "key": key }),
        Event::Error { message, .. } => json!({ "type": "error", "key": key, "message": message }),
    }
}
