//! inkpad — run a shared pad authority or join one from the terminal.
//!
//! `serve` hosts the authority behind a WebSocket listener. `join` is a
//! headless participant: stdin lines stand in for the editor surface and
//! a full sync engine keeps the local copy reconciled.

mod cli;

use clap::Parser;
use log::info;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use inkpad_collab::client::{ClientConfig, SyncClient};
use inkpad_collab::directory::FileDirectory;
use inkpad_collab::engine::{EngineConfig, SyncEngine};
use inkpad_collab::mirror::LocalMirror;
use inkpad_collab::protocol::{Drawing, Point, Segment};
use inkpad_collab::server::{ServerConfig, SyncServer};

use cli::{Cli, Command, JoinArgs, ServeArgs};

const HELP: &str = "\
  <text>                 append a line to the shared text
  :rev N                 restore revision N
  :line X1 Y1 X2 Y2 [S]  draw a segment with optional style S
  :clear                 clear the drawing
  :show                  print the local copy
  :quit                  leave";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Join(args) => join(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig {
        bind_addr: args.bind,
        server_name: args.name,
        initial_text: args.initial_text,
        delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
        ..ServerConfig::default()
    };
    let mut server = SyncServer::new(config);
    if let Some(path) = args.directory {
        server = server.with_directory(Arc::new(FileDirectory::new(path)));
    }

    info!("Starting {} on {}", server.server_name(), server.bind_addr());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections and {} calls",
                stats.total_connections, stats.total_calls
            );
        }
    }
    Ok(())
}

async fn join(args: JoinArgs) -> Result<(), Box<dyn Error>> {
    let mut client = match (args.server, args.directory) {
        (Some(url), _) => SyncClient::new(url, ClientConfig::default()),
        (None, Some(path)) => {
            let name = args.name.clone();
            tokio::task::spawn_blocking(move || {
                SyncClient::from_directory(&FileDirectory::new(path), &name, ClientConfig::default())
            })
            .await??
        }
        (None, None) => SyncClient::new("ws://127.0.0.1:9090", ClientConfig::default()),
    };
    let events = client.take_event_rx();
    client.connect().await?;
    let participant = client.register().await?;
    println!("Joined {} as {}", client.server_url(), participant.name);
    println!("{HELP}");

    let client = Arc::new(client);
    let mirror = Arc::new(LocalMirror::new());
    let config = EngineConfig {
        drawing_interval: Duration::from_millis(args.drawing_interval_ms),
        revision_interval: Duration::from_millis(args.revision_interval_ms),
        ..EngineConfig::default()
    };
    let engine = Arc::new(SyncEngine::new(client.clone(), participant, mirror.clone(), config));
    let handle = engine.spawn(events);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&mirror, line.trim_end()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("{e}\n{HELP}"),
        }
    }

    handle.shutdown().await;
    client.disconnect().await;
    Ok(())
}

/// Apply one stdin line to the mirror. Returns `false` on `:quit`.
fn run_command(mirror: &LocalMirror, line: &str) -> Result<bool, String> {
    let Some(command) = line.strip_prefix(':') else {
        let mut text = mirror.text();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(line);
        let caret = text.chars().count();
        mirror.edit_text(text, caret);
        return Ok(true);
    };

    let mut words = command.split_whitespace();
    match words.next() {
        Some("quit") => return Ok(false),
        Some("rev") => {
            let revision = words
                .next()
                .and_then(|w| w.parse::<u64>().ok())
                .ok_or("usage: :rev N")?;
            mirror.request_rollback(revision);
        }
        Some("line") => {
            let coords: Vec<i32> = words
                .by_ref()
                .take(4)
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|e| format!("bad coordinate: {e}"))?;
            let [x1, y1, x2, y2] = coords[..] else {
                return Err("usage: :line X1 Y1 X2 Y2 [STYLE]".into());
            };
            let (from, to) = (Point::new(x1, y1), Point::new(x2, y2));
            let segment = match words.next() {
                Some(style) => Segment::styled(from, to, style),
                None => Segment::new(from, to),
            };
            mirror.draw(segment);
        }
        Some("clear") => mirror.replace_drawing(Drawing::default()),
        Some("show") => {
            println!("── revision {} ──", mirror.revision_display());
            println!("{}", mirror.text());
            for segment in mirror.drawing().segments {
                println!(
                    "  ({}, {}) → ({}, {}) {}",
                    segment.from.x,
                    segment.from.y,
                    segment.to.x,
                    segment.to.y,
                    segment.style.as_deref().unwrap_or("")
                );
            }
        }
        _ => return Err(format!("unknown command: :{command}")),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_plain_lines_append() {
        let mirror = LocalMirror::new();
        assert_eq!(run_command(&mirror, "first"), Ok(true));
        assert_eq!(run_command(&mirror, "second"), Ok(true));
        assert_eq!(mirror.text(), "first\nsecond");
        assert_eq!(mirror.caret(), 12);
    }

    #[test]
    fn test_drawing_commands() {
        let mirror = LocalMirror::new();
        run_command(&mirror, ":line 0 0 5 5 red").unwrap();
        run_command(&mirror, ":line 1 2 3 4").unwrap();
        let drawing = mirror.drawing();
        assert_eq!(drawing.len(), 2);
        assert_eq!(drawing.segments[0].style.as_deref(), Some("red"));

        assert!(run_command(&mirror, ":line 1 2 x 4").is_err());
        assert!(run_command(&mirror, ":line 1 2").is_err());

        run_command(&mirror, ":clear").unwrap();
        assert!(mirror.drawing().is_empty());
    }

    #[test]
    fn test_rev_and_quit() {
        let mirror = LocalMirror::new();
        run_command(&mirror, ":rev 2").unwrap();
        assert_eq!(mirror.take_rollback_request(), Some(2));
        assert!(run_command(&mirror, ":rev two").is_err());
        assert_eq!(run_command(&mirror, ":quit"), Ok(false));
        assert!(run_command(&mirror, ":nope").is_err());
    }
}
