use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use inkpad_collab::server::DEFAULT_SERVER_NAME;

#[derive(Parser, Debug)]
#[command(name = "inkpad")]
#[command(about = "Shared text and drawing pad")]
#[command(version)]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the authority
    Serve(ServeArgs),
    /// Join a running authority as a participant
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    pub bind: String,

    /// Name to publish the server under
    #[arg(short, long, default_value = DEFAULT_SERVER_NAME)]
    pub name: String,

    /// Text of revision 1
    #[arg(long, default_value = "hello")]
    pub initial_text: String,

    /// Milliseconds a participant may take to accept a notification
    #[arg(long, default_value_t = 2000)]
    pub delivery_timeout_ms: u64,

    /// Directory file to publish the endpoint in
    #[arg(short, long, value_name = "PATH")]
    pub directory: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    /// Server URL (ws://host:port); takes precedence over --directory
    #[arg(short, long, value_name = "URL")]
    pub server: Option<String>,

    /// Directory file to resolve the server name in
    #[arg(short, long, value_name = "PATH")]
    pub directory: Option<PathBuf>,

    /// Server name to resolve
    #[arg(short, long, default_value = DEFAULT_SERVER_NAME)]
    pub name: String,

    /// Milliseconds between drawing syncs
    #[arg(long, default_value_t = 1000)]
    pub drawing_interval_ms: u64,

    /// Milliseconds between revision indicator refreshes
    #[arg(long, default_value_t = 5000)]
    pub revision_interval_ms: u64,
}
