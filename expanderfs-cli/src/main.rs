use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, Subcommand};
use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use expanderfs_core::loopback::{BoundedSink, LoopbackHost};
use expanderfs_core::types::LogLevel;
use expanderfs_core::{
    CallbackData, CommandId, DataStreamId, EnumerationId, PlaceholderInfo, Provider,
    ProviderCallbacks, ProviderConfig, Status,
};

/// How long the dry run waits for a deferred callback to complete.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "expanderfs")]
#[command(about = "Projects a source directory into a virtualization root on demand")]
#[command(version)]
struct Cli {
    /// Log level, overriding the config file
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start virtualizing and run until Ctrl-C
    Mount {
        /// Virtualization root the source tree is projected into
        #[arg(short = 'v', long)]
        virt_root: PathBuf,

        /// Source directory backing the projection
        #[arg(short, long)]
        src_root: PathBuf,

        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Host worker threads (pool and concurrent)
        #[arg(short, long)]
        threads: Option<u32>,
    },

    /// Dry run: list a source directory through the provider without an OS host
    Check {
        /// Source directory backing the projection
        #[arg(short, long)]
        src_root: PathBuf,

        /// Directory to list, relative to the source root (default: the root)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Entries the directory buffer holds per call
        #[arg(short, long, default_value_t = 64)]
        buffer: usize,

        /// Also stream every listed file and compare it with the source
        #[arg(long)]
        verify: bool,

        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Mount { virt_root, src_root, config, threads } => {
            let mut config = load_config(config.as_deref(), virt_root, src_root)?;
            if let Some(threads) = threads {
                config.pool_thread_count = threads;
                config.concurrent_thread_count = threads;
            }
            init_tracing(cli.log_level.unwrap_or(config.log_level));
            info!(
                "Mounting {} at {}",
                config.source_root.display(),
                config.virtualization_root.display()
            );
            mount(config).await?;
        }
        Commands::Check { src_root, path, buffer, verify, config } => {
            let scratch = tempfile::Builder::new()
                .prefix("expanderfs-check")
                .tempdir()
                .context("failed to create a scratch virtualization root")?;
            let config = load_config(config.as_deref(), scratch.path().join("virt"), src_root)?;
            init_tracing(cli.log_level.unwrap_or(config.log_level));
            if buffer == 0 {
                bail!("--buffer must hold at least one entry");
            }

            let path = path.unwrap_or_default();
            tokio::task::spawn_blocking(move || check(config, &path, buffer, verify))
                .await
                .context("dry run panicked")??;
            drop(scratch);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("expanderfs={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(file: Option<&Path>, virt_root: PathBuf, src_root: PathBuf) -> Result<ProviderConfig> {
    let mut config = match file {
        Some(path) => ProviderConfig::from_json_file(path)?,
        None => ProviderConfig::default(),
    };
    config.virtualization_root = virt_root;
    config.source_root = src_root;
    Ok(config)
}

#[cfg(windows)]
async fn mount(config: ProviderConfig) -> Result<()> {
    use expanderfs_windows::ProjFsHost;

    let provider = Provider::new(config, Arc::new(ProjFsHost::new()))
        .context("invalid configuration")?;
    provider.start().context("failed to start virtualization")?;
    if let Some(instance_id) = provider.instance_id() {
        info!("Virtualization instance {} is running; press Ctrl-C to stop", instance_id);
    }

    tokio::signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;
    info!("Stopping virtualization");

    let stats = tokio::task::spawn_blocking(move || {
        provider.stop();
        provider.stats()
    })
    .await
    .context("shutdown panicked")?;
    info!("Final statistics: {}", stats);
    Ok(())
}

#[cfg(not(windows))]
async fn mount(_config: ProviderConfig) -> Result<()> {
    bail!("mount needs the Windows Projected File System; use `expanderfs check` for a dry run on this platform");
}

/// Command ids for the dry run's callbacks.
struct CommandCounter {
    next: i32,
}

impl CommandCounter {
    fn next(&mut self) -> CommandId {
        self.next += 1;
        CommandId(self.next)
    }
}

/// Waits out a deferred callback.
fn settle(host: &LoopbackHost, command: CommandId, status: Status) -> Result<Status> {
    if status != Status::Pending {
        return Ok(status);
    }
    debug!("Command {} deferred, waiting for completion", command);
    host.wait_for_completion(command, COMPLETION_TIMEOUT)
        .with_context(|| format!("command {} was never completed", command))
}

fn check(config: ProviderConfig, path: &Path, buffer: usize, verify: bool) -> Result<()> {
    let host = Arc::new(LoopbackHost::new());
    let provider = Provider::new(config, host.clone()).context("invalid configuration")?;
    provider.start().context("failed to start the dry run")?;
    let callbacks = host
        .dispatcher()
        .context("the loopback host dropped its dispatcher")?;
    let source_root = provider.roots().source_root.clone();

    let mut commands = CommandCounter { next: 0 };
    let entries = list(callbacks.as_ref(), &host, &mut commands, path, buffer)?;
    for (name, info) in &entries {
        if info.is_directory {
            println!("{:>14}  {}", "<DIR>", name);
        } else {
            println!("{:>14}  {}", info.size, name);
        }
    }
    println!("{} entries", entries.len());

    if verify {
        let mut mismatches = 0;
        for (name, info) in entries.iter().filter(|(_, info)| !info.is_directory) {
            let relative = path.join(name);
            if !verify_file(callbacks.as_ref(), &host, &mut commands, &source_root, &relative, info)? {
                println!("MISMATCH  {}", relative.display());
                mismatches += 1;
            }
        }
        if mismatches > 0 {
            bail!("{} files differ from the source", mismatches);
        }
        println!("all files match the source");
    }

    drop(callbacks);
    provider.stop();
    info!("Dry run statistics: {}", provider.stats());
    Ok(())
}

fn list(
    callbacks: &dyn ProviderCallbacks,
    host: &LoopbackHost,
    commands: &mut CommandCounter,
    path: &Path,
    buffer: usize,
) -> Result<Vec<(String, PlaceholderInfo)>> {
    let id = EnumerationId::new_random();
    let command = commands.next();
    let status = callbacks.start_directory_enumeration(&CallbackData::new(command, path), id);
    match settle(host, command, status)? {
        Status::Ok => {}
        Status::NotFound => bail!("{} does not exist in the source tree", path.display()),
        other => bail!("starting the enumeration failed: {}", other),
    }

    let mut entries = Vec::new();
    loop {
        let mut sink = BoundedSink::with_capacity(buffer);
        let data = CallbackData::new(commands.next(), path);
        let status = callbacks.get_directory_enumeration(&data, id, None, &mut sink);
        if status != Status::Ok {
            bail!("listing {} failed: {}", path.display(), status);
        }
        if sink.is_empty() {
            break;
        }
        entries.extend(sink.entries().iter().cloned());
    }

    callbacks.end_directory_enumeration(&CallbackData::new(commands.next(), path), id);
    Ok(entries)
}

fn verify_file(
    callbacks: &dyn ProviderCallbacks,
    host: &LoopbackHost,
    commands: &mut CommandCounter,
    source_root: &Path,
    relative: &Path,
    info: &PlaceholderInfo,
) -> Result<bool> {
    let Ok(length) = u32::try_from(info.size) else {
        println!("{:>14}  {} (too large to stream in one request)", "skipped", relative.display());
        return Ok(true);
    };

    let command = commands.next();
    let mut stream_bytes = [0u8; 16];
    stream_bytes[..4].copy_from_slice(&command.0.to_le_bytes());
    let stream = DataStreamId::from_bytes(stream_bytes);
    let data = CallbackData::new(command, relative).with_stream(stream);
    let status = settle(host, command, callbacks.get_file_data(&data, 0, length))?;
    if status != Status::Ok {
        bail!("reading {} failed: {}", relative.display(), status);
    }

    let expected = fs::read(source_root.join(relative))
        .with_context(|| format!("failed to read {} from the source", relative.display()))?;
    Ok(host.file_data(&stream) == expected)
}
