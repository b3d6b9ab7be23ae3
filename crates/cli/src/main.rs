//! cdcsync: delta-efficient asset delivery
//!
//! One binary, two surfaces:
//! - one-shot sync (`cdcsync SOURCE... DEST`) over the rolling-hash delta
//!   protocol, locally or against a remote agent
//! - the streaming manager (`cdcsync stream ...`) that exposes a live
//!   content-addressed view of a source directory to remote instances

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand, builder::Styles};
use tracing::{info, warn};

use cdcsync_core::{Cas, ErrorKind, FilterRule};
use cdcsync_stream::{
    DaemonConfig, ManagerConfig, MgmtClient, MgmtServer, PortRange, SessionKey, SessionManager,
    SessionRequest, SystemProcessFactory, spawn_cas_maintenance,
};
use cdcsync_sync::{SyncClient, SyncOptions, SyncServer};

/// Default port of a remote sync agent
const DEFAULT_AGENT_PORT: u16 = 45870;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "cdcsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(args_conflicts_with_subcommands = true)]
#[command(about = "Delta-efficient file sync and asset streaming")]
#[command(long_about = r#"
cdcsync copies directory trees with rolling-hash deltas and streams live
source directories to remote instances from a content-addressed store.

Examples:
  cdcsync -r ./assets/ build@devkit:. --ip 10.0.0.7     One-shot sync
  cdcsync -rn --delete ./assets/ /srv/mirror            Dry-run with deletes
  cdcsync stream start --src ./assets --remote build@devkit --mount /mnt/assets
  cdcsync stream status
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    sync: SyncArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage streaming sessions
    Stream {
        #[command(subcommand)]
        command: StreamCommands,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Source paths followed by the destination
    #[arg(value_name = "PATH")]
    paths: Vec<String>,

    /// Recurse into directories
    #[arg(short, long)]
    recursive: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Print nothing but errors
    #[arg(long)]
    quiet: bool,

    /// Send changed files whole instead of as deltas
    #[arg(short = 'W', long)]
    whole_file: bool,

    /// Keep the full source path under the destination
    #[arg(short = 'R', long)]
    relative: bool,

    /// Compress file data and deltas in transit
    #[arg(short = 'z', long)]
    compress: bool,

    /// zstd level for -z
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(i32).range(1..=22))]
    compress_level: i32,

    /// Compare file contents, not size and mtime
    #[arg(short, long)]
    checksum: bool,

    /// Report what would change without touching the destination
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Remove destination files the source no longer has (requires -r)
    #[arg(long)]
    delete: bool,

    /// Only update files that already exist on the destination
    #[arg(long)]
    existing: bool,

    /// Machine-readable summary on stdout
    #[arg(long)]
    json: bool,

    /// Connect to a remote agent at this address
    #[arg(long, value_name = "ADDR")]
    ip: Option<String>,

    /// Remote agent port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Connection timeout in seconds
    #[arg(long, value_name = "SEC", default_value_t = 10)]
    contimeout: u64,

    /// Alternate basis directory consulted for unchanged blocks
    #[arg(long, value_name = "PATH")]
    copy_dest: Option<String>,

    /// Include pattern (ordered with --exclude; first match wins)
    #[arg(long, value_name = "PAT")]
    include: Vec<String>,

    /// Exclude pattern (ordered with --include; first match wins)
    #[arg(long, value_name = "PAT")]
    exclude: Vec<String>,

    /// File of include patterns, one per line
    #[arg(long, value_name = "FILE")]
    include_from: Vec<PathBuf>,

    /// File of exclude patterns, one per line
    #[arg(long, value_name = "FILE")]
    exclude_from: Vec<PathBuf>,

    /// Sync exactly the paths listed in FILE (implies --relative)
    #[arg(long, value_name = "FILE")]
    files_from: Option<PathBuf>,
}

#[derive(Subcommand)]
enum StreamCommands {
    /// Run the streaming manager daemon
    Daemon {
        /// Directory holding cdcsync.toml
        #[arg(long, value_name = "DIR", default_value = ".")]
        config: PathBuf,
    },
    /// Start a streaming session
    Start {
        /// Source directory to stream
        #[arg(long, value_name = "DIR")]
        src: PathBuf,
        /// Remote instance as user@host
        #[arg(long, value_name = "USER@HOST")]
        remote: String,
        /// Remote mount directory
        #[arg(long, value_name = "DIR")]
        mount: String,
        /// Remote SSH port
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        /// Override the remote-execution command prefix
        #[arg(long, value_name = "CMD")]
        ssh_cmd: Option<String>,
        /// Override the copy command prefix
        #[arg(long, value_name = "CMD")]
        scp_cmd: Option<String>,
        /// Manager's management port
        #[arg(long, default_value_t = 45800)]
        mgmt_port: u16,
    },
    /// Stop a streaming session
    Stop {
        #[arg(long, value_name = "USER@HOST")]
        remote: String,
        #[arg(long, value_name = "DIR")]
        mount: String,
        #[arg(long, default_value_t = 45800)]
        mgmt_port: u16,
    },
    /// Show session status
    Status {
        /// Keep printing snapshots
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 45800)]
        mgmt_port: u16,
    },
}

fn main() -> ExitCode {
    let _ = color_eyre::install();

    let matches = match Cli::command().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            // clap's own exit codes don't match ours: usage errors are 1.
            let is_help = matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = err.print();
            return if is_help {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            };
        }
    };
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let filter = match (cli.sync.quiet, cli.sync.verbosity) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Some(Commands::Stream { command }) => run_stream(command),
        None => run_sync(&cli.sync, &matches),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error ({}): {}", err.kind().as_str(), err.message());
            ExitCode::from(exit_code_for(err.kind()))
        }
    }
}

/// Exit codes: 0 success, 1 usage, 2 transport, 3 remote
fn exit_code_for(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidArgument => 1,
        ErrorKind::Unavailable | ErrorKind::DeadlineExceeded | ErrorKind::Aborted => 2,
        _ => 3,
    }
}

fn run_sync(args: &SyncArgs, matches: &ArgMatches) -> cdcsync_core::Result<ExitCode> {
    if args.delete && !args.recursive {
        return Err(cdcsync_core::Error::invalid_argument(
            "--delete requires -r/--recursive",
        ));
    }
    if args.paths.len() < 2 {
        return Err(cdcsync_core::Error::invalid_argument(
            "need at least one source and a destination",
        ));
    }
    let (dest, sources) = args.paths.split_last().unwrap();

    let mut options = SyncOptions {
        recursive: args.recursive,
        whole_file: args.whole_file,
        relative: args.relative || args.files_from.is_some(),
        compress: args.compress,
        compress_level: args.compress_level,
        checksum: args.checksum,
        dry_run: args.dry_run,
        delete: args.delete,
        existing: args.existing,
        copy_dest: args.copy_dest.clone(),
        dest: String::new(),
        rules: ordered_rules(args, matches)?,
    };

    // --files-from: the single source is the base, the file lists the paths.
    let (sources, base) = match &args.files_from {
        Some(list_path) => {
            if sources.len() != 1 {
                return Err(cdcsync_core::Error::invalid_argument(
                    "--files-from takes exactly one source directory",
                ));
            }
            let base = PathBuf::from(&sources[0]);
            let listed = read_pattern_file(list_path)?
                .into_iter()
                .map(|line| base.join(line))
                .collect();
            (listed, Some(base))
        }
        None => (sources.iter().map(PathBuf::from).collect(), None),
    };

    let report = if let Some(ip) = &args.ip {
        // Remote mode: the destination names a path under the agent's root.
        options.dest = dest.clone();
        let port = args.port.unwrap_or(DEFAULT_AGENT_PORT);
        let addr = (ip.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| {
                cdcsync_core::Error::invalid_argument(format!("bad address {ip}:{port}"))
                    .with_source(e)
            })?
            .next()
            .ok_or_else(|| {
                cdcsync_core::Error::invalid_argument(format!("bad address {ip}:{port}"))
            })?;
        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_secs(args.contimeout)).map_err(
                |e| {
                    cdcsync_core::Error::unavailable(format!("cannot reach agent at {addr}"))
                        .with_source(e)
                },
            )?;
        let mut client = SyncClient::new(options, sources)?;
        if let Some(base) = base {
            client = client.with_base(base);
        }
        client.run(stream)?
    } else {
        // Local mode: run the server half in-process over a loopback pair.
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let dest_root = PathBuf::from(dest);
        let server_thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept()?;
            SyncServer::new(dest_root).serve(stream)
        });

        let stream = TcpStream::connect(("127.0.0.1", port))?;
        let mut client = SyncClient::new(options, sources)?;
        if let Some(base) = base {
            client = client.with_base(base);
        }
        let report = client.run(stream);
        let server_result = server_thread
            .join()
            .map_err(|_| cdcsync_core::Error::internal("server thread panicked"))?;
        let report = report?;
        server_result?;
        report
    };

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "summary": report.summary,
                "stats": report.stats,
            })
        );
    } else if !args.quiet {
        let s = &report.summary;
        println!(
            "{}{} files: {} missing, {} changed, {} unchanged, {} deleted",
            if s.dry_run { "(dry run) " } else { "" },
            s.files_total,
            s.files_missing,
            s.files_changed,
            s.files_unchanged,
            s.files_deleted,
        );
        println!(
            "sent {} bytes whole, {} bytes as delta literals, reused {} bytes",
            s.data_bytes, s.literal_bytes, s.matched_bytes,
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Rebuild the single ordered rule list from the interleaved
/// include/exclude flags, using argv positions to restore order.
fn ordered_rules(args: &SyncArgs, matches: &ArgMatches) -> cdcsync_core::Result<Vec<FilterRule>> {
    let mut indexed: Vec<(usize, Vec<FilterRule>)> = Vec::new();

    if let Some(indices) = matches.indices_of("include") {
        for (index, pattern) in indices.zip(&args.include) {
            indexed.push((index, vec![FilterRule::include(pattern)]));
        }
    }
    if let Some(indices) = matches.indices_of("exclude") {
        for (index, pattern) in indices.zip(&args.exclude) {
            indexed.push((index, vec![FilterRule::exclude(pattern)]));
        }
    }
    if let Some(indices) = matches.indices_of("include_from") {
        for (index, path) in indices.zip(&args.include_from) {
            let rules = read_pattern_file(path)?
                .into_iter()
                .map(FilterRule::include)
                .collect();
            indexed.push((index, rules));
        }
    }
    if let Some(indices) = matches.indices_of("exclude_from") {
        for (index, path) in indices.zip(&args.exclude_from) {
            let rules = read_pattern_file(path)?
                .into_iter()
                .map(FilterRule::exclude)
                .collect();
            indexed.push((index, rules));
        }
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().flat_map(|(_, rules)| rules).collect())
}

/// Read a pattern/path list file: one entry per line, `#` comments
fn read_pattern_file(path: &PathBuf) -> cdcsync_core::Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        cdcsync_core::Error::invalid_argument(format!("cannot read {}", path.display()))
            .with_source(e)
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn run_stream(command: StreamCommands) -> cdcsync_core::Result<ExitCode> {
    match command {
        StreamCommands::Daemon { config } => run_daemon(&config),
        StreamCommands::Start {
            src,
            remote,
            mount,
            ssh_port,
            ssh_cmd,
            scp_cmd,
            mgmt_port,
        } => {
            let request = SessionRequest {
                src_dir: std::fs::canonicalize(&src)?,
                user_host: remote.clone(),
                ssh_port,
                mount_dir: mount,
                ssh_cmd: ssh_cmd.unwrap_or_else(|| format!("ssh -p {ssh_port} {remote}")),
                scp_cmd: scp_cmd.unwrap_or_else(|| format!("scp -P {ssh_port}")),
            };
            let status = MgmtClient::connect(mgmt_port)?.start_session(&request)?;
            println!(
                "session {}:{} {} (local port {}, remote port {})",
                status.user_host, status.mount_dir, status.state, status.local_port, status.remote_port,
            );
            Ok(ExitCode::SUCCESS)
        }
        StreamCommands::Stop {
            remote,
            mount,
            mgmt_port,
        } => {
            let status = MgmtClient::connect(mgmt_port)?.stop_session(&SessionKey {
                user_host: remote,
                mount_dir: mount,
            })?;
            println!("session {}:{} {}", status.user_host, status.mount_dir, status.state);
            Ok(ExitCode::SUCCESS)
        }
        StreamCommands::Status {
            follow,
            json,
            mgmt_port,
        } => {
            MgmtClient::connect(mgmt_port)?.status(
                follow,
                Duration::from_secs(2),
                |snapshot| {
                    if json {
                        println!("{}", serde_json::to_string(&snapshot).unwrap_or_default());
                    } else if snapshot.is_empty() {
                        println!("no sessions");
                    } else {
                        for s in snapshot {
                            println!(
                                "{}:{} {} root={} heartbeat={}",
                                s.user_host,
                                s.mount_dir,
                                s.state,
                                s.manifest_root.get(..16).unwrap_or(""),
                                s.heartbeat_age_secs
                                    .map_or_else(|| "never".to_string(), |a| format!("{a}s ago")),
                            );
                        }
                    }
                },
            )?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_daemon(config_dir: &PathBuf) -> cdcsync_core::Result<ExitCode> {
    let config = DaemonConfig::load(config_dir)?;
    let cas_dir = config.cas_dir_or_default();
    info!("content store at {}", cas_dir.display());
    let cas = Arc::new(Cas::open(&cas_dir)?);
    for hash in cas.invalid() {
        warn!("store is missing live blob {hash}; affected manifests are invalid");
    }

    let manager = Arc::new(SessionManager::new(
        Arc::clone(&cas),
        Arc::new(SystemProcessFactory),
        ManagerConfig {
            port_range: PortRange {
                first: config.ports.first,
                last: config.ports.last,
            },
            segment_name: "cdcsync".to_string(),
            fuse_binary: config.fuse_binary.clone(),
            timeouts: config.timeouts,
        },
    )?);

    let maintenance_shutdown = Arc::new(AtomicBool::new(false));
    let _maintenance =
        spawn_cas_maintenance(cas, config.sweep, Arc::clone(&maintenance_shutdown));
    let _port_reconciler = std::thread::spawn({
        let manager = Arc::clone(&manager);
        move || loop {
            std::thread::sleep(Duration::from_secs(30));
            manager.reconcile_ports();
        }
    });

    let listener = TcpListener::bind(("127.0.0.1", config.mgmt_port))?;
    let server = MgmtServer::start(listener, Arc::clone(&manager))?;
    info!("management endpoint on 127.0.0.1:{}", server.port());

    // Sessions are driven entirely over the management endpoint; park here
    // until the process is terminated.
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
