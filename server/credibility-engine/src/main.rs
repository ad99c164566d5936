//! Binary entrypoint: read JSON command lines from stdin, write JSON response lines
//! to stdout.
//!
//! Each input line is a `Command` tagged by `op`. Each output line is either the
//! operation's result or an `ErrorOutput`. Logs go to stderr. A background sweep
//! fires elapsed check-ins while the stream is open; on EOF the state snapshot is
//! written (when `CREDIBILITY_STATE_PATH` is set).

use anyhow::Result;
use credibility_engine::clock::SystemClock;
use credibility_engine::command;
use credibility_engine::notify::ChannelDispatcher;
use credibility_engine::store::MemoryStore;
use credibility_engine::{sweeper, Config, Engine};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(EnvFilter::from_default_env().add_directive("credibility_engine=info".parse()?))
    .init();

  let config = Config::from_env()?;
  let store = Arc::new(match &config.state_path {
    Some(path) => MemoryStore::load(path)?,
    None => MemoryStore::new(),
  });

  let (dispatcher, mut events) = ChannelDispatcher::new();
  let consumer = tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      match serde_json::to_string(&event) {
        Ok(json) => info!(event = %json, "notification"),
        Err(e) => info!(error = %e, "unserializable notification"),
      }
    }
  });

  let engine = Arc::new(Engine::new(
    config.clone(),
    store.clone(),
    Arc::new(dispatcher),
    Arc::new(SystemClock),
  ));
  let (sweeper, stop) = sweeper::spawn(engine.clone(), Duration::from_secs(config.sweep_interval_secs.max(1)));
  info!(state_path = ?config.state_path, "credibility engine ready");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut out = tokio::io::stdout();
  while let Some(line) = lines.next_line().await? {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    let response = command::handle_line(&engine, trimmed);
    out.write_all(response.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
  }

  // Receiver only disappears if the sweeper already exited.
  let _ = stop.send(true);
  sweeper.await?;
  if let Some(path) = &config.state_path {
    store.save(path)?;
    info!(path = %path.display(), "state saved");
  }
  drop(engine);
  consumer.await?;
  Ok(())
}
