mod cache;
mod config;
mod http;
mod network;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{CacheStorage, SqliteStorage};
use config::{Config, Strategy};
use http::{Request, Response};
use network::{HttpNetwork, Network};
use worker::{ActivateReport, FetchOutcome, InstallReport, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "Versioned offline asset cache with network-first and cache-first serving")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./precache.yaml, then $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the current cache version with the asset manifest
  Install,
  /// Delete every cache version except the current one
  Activate,
  /// Install, then activate
  Deploy,
  /// Serve one request through the worker
  Fetch {
    /// URL to request, relative URLs resolve against base_url
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// HTTP method
    #[arg(long, default_value = "GET")]
    method: String,
    /// Override the configured strategy
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List stored cache versions
  Caches {
    /// Also list the manifest and cached URLs of each version
    #[arg(long)]
    entries: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose, args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let storage = Arc::new(match &config.storage_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  });
  let network = Arc::new(HttpNetwork::new(config.request_timeout())?);

  match args.command {
    Command::Install => {
      let worker = ServiceWorker::new(config.worker_config()?, storage, network);
      print_install(&worker.on_install().await?);
    }
    Command::Activate => {
      let worker = ServiceWorker::new(config.worker_config()?, storage, network);
      print_activate(&worker.on_activate().await?);
    }
    Command::Deploy => {
      let worker = ServiceWorker::new(config.worker_config()?, storage, network);
      print_install(&worker.on_install().await?);
      print_activate(&worker.on_activate().await?);
    }
    Command::Fetch {
      url,
      navigate,
      method,
      strategy,
      output,
    } => {
      let mut worker_config = config.worker_config()?;
      if let Some(strategy) = strategy {
        worker_config.strategy = strategy;
      }

      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let url = worker_config.resolve(&url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      }
      .with_method(method);

      let worker = ServiceWorker::new(worker_config, storage, Arc::clone(&network));
      let outcome = worker.on_fetch(&request).await;
      worker.flush().await;

      let response = match outcome {
        FetchOutcome::Served(result) => {
          eprintln!(
            "{} {} ({}, {})",
            result.data.status,
            request.url,
            result.source,
            result.data.header("content-type").unwrap_or("unknown type")
          );
          if let Some(cached_at) = result.cached_at {
            eprintln!("cached at {}", cached_at.format("%Y-%m-%d %H:%M:%S UTC"));
          }
          result.data
        }
        FetchOutcome::Passthrough => {
          debug!(url = %request.url, "Performing passthrough request");
          let response = network.fetch(&request).await?;
          eprintln!("{} {} (passthrough)", response.status, request.url);
          response
        }
        FetchOutcome::NetworkError => {
          return Err(eyre!(
            "Network error: {} is unavailable and not cached",
            request.url
          ));
        }
      };

      write_body(&response, output.as_deref())?;
    }
    Command::Caches { entries } => {
      let current = &config.cache_version;
      for info in storage.list_caches()? {
        let marker = if &info.name == current { "*" } else { " " };
        let state = match info.installed_at {
          Some(at) => format!("installed {}", at.format("%Y-%m-%d %H:%M:%S")),
          None => "not installed".to_string(),
        };
        println!("{} {:<32} {:>6} entries  {}", marker, info.name, info.entries, state);

        if entries {
          for asset in storage.manifest(&info.name)? {
            println!("    manifest {}", asset);
          }
          for url in storage.keys(&info.name)? {
            println!("    cached   {}", url);
          }
        }
      }
    }
  }

  Ok(())
}

/// Set up tracing. The returned guard must live until exit so buffered log
/// lines reach the file.
fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let default = match verbose {
    0 => "precache=warn",
    1 => "precache=info",
    _ => "precache=debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  match log_file {
    Some(path) => {
      let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
      };
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

      Ok(None)
    }
  }
}

fn print_install(report: &InstallReport) {
  println!(
    "Installed {}: {} cached, {} failed",
    report.cache,
    report.cached.len(),
    report.failed.len()
  );
  for (asset, reason) in &report.failed {
    println!("  failed {}: {}", asset, reason);
  }
}

fn print_activate(report: &ActivateReport) {
  println!(
    "Activated {}: {} stale caches deleted",
    report.cache,
    report.deleted.len()
  );
  for name in &report.deleted {
    println!("  deleted {}", name);
  }
  for (name, reason) in &report.failed {
    println!("  could not delete {}: {}", name, reason);
  }
}

fn write_body(response: &Response, output: Option<&Path>) -> Result<()> {
  match output {
    Some(path) => std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => {
      let mut stdout = std::io::stdout().lock();
      stdout
        .write_all(&response.body)
        .and_then(|_| stdout.flush())
        .map_err(|e| eyre!("Failed to write response body: {}", e))
    }
  }
}
