use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stash",
    about = "Read, write and watch a stash key/value store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend to use, overriding the configuration file
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// JSON file for the json backend
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    /// etcd endpoint, may be repeated
    #[arg(long = "endpoint", global = true)]
    pub endpoints: Vec<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Memory,
    Json,
    Etcd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the value stored at a key
    Get(GetArgs),
    /// Store a JSON value at a key
    Set(SetArgs),
    /// Remove a key
    Delete(KeyArgs),
    /// Check whether a key exists
    Exists(KeyArgs),
    /// List keys under a prefix
    Keys(PrefixArgs),
    /// Count keys under a prefix
    Len(PrefixArgs),
    /// Print every key and value under a prefix
    Dump(PrefixArgs),
    /// Stream changes under a prefix
    Watch(WatchArgs),
}

#[derive(Args)]
pub struct KeyArgs {
    pub key: String,
    /// Bucket path, one segment per flag
    #[arg(short, long)]
    pub bucket: Vec<String>,
}

#[derive(Args)]
pub struct GetArgs {
    pub key: String,
    #[arg(short, long)]
    pub bucket: Vec<String>,
    /// Print the stored bytes as hex instead of decoding them
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args)]
pub struct SetArgs {
    pub key: String,
    /// Value as JSON; bare words are stored as strings
    pub value: String,
    #[arg(short, long)]
    pub bucket: Vec<String>,
    /// Expire the key after this many milliseconds
    #[arg(long)]
    pub ttl_ms: Option<u64>,
}

#[derive(Args)]
pub struct PrefixArgs {
    #[arg(default_value = "")]
    pub prefix: String,
    #[arg(short, long)]
    pub bucket: Vec<String>,
}

#[derive(Args)]
pub struct WatchArgs {
    #[arg(default_value = "")]
    pub prefix: String,
    #[arg(short, long)]
    pub bucket: Vec<String>,
    /// Exit after this many events
    #[arg(long)]
    pub count: Option<usize>,
}
