use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corelock::arbiter::{ArbiterClient, JobRequest, Server, DEFAULT_PORT};
use corelock::batch::{discover_problems, run_batch, BatchOptions, ExpectSource};
use corelock::config::{detected_cores, BenchConfig, DaemonConfig};
use corelock::executor::Classification;
use corelock::shutdown::forward_signals;
use corelock::snapshot::SnapshotStore;

#[derive(Parser, Debug)]
#[command(name = "corelock")]
#[command(about = "Cluster-local core arbitration daemon and prover benchmark runner")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the arbitration daemon in the foreground
    Daemon {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Cores to arbitrate (default: all cores of this host)
        #[arg(long)]
        max_cores: Option<u32>,

        /// Append log records to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Show running and waiting jobs
    Status {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Tell the daemon to reject all new acquire requests
    StopAccepting {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Hold cores while a command runs
    Exec {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Cores to hold; 0 takes the whole host
        #[arg(short = 'j', long, default_value_t = 0)]
        cores: i32,

        #[arg(short, long, default_value_t = 0)]
        priority: i32,

        #[arg(long)]
        tag: Option<String>,

        /// Command and arguments to run while holding the cores
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Run a prover batch and record a snapshot
    Run {
        /// TOML benchmark configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Problem files; directories are walked recursively
        #[arg(required = true)]
        problems: Vec<PathBuf>,

        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        memory: Option<u64>,

        #[arg(short = 'j', long)]
        parallelism: Option<usize>,

        /// Hold a daemon grant around the whole batch
        #[arg(long)]
        lock: bool,

        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Expect this outcome for every problem instead of reading the
        /// expect: directive
        #[arg(long)]
        expect: Option<String>,

        #[arg(long)]
        meta: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            // Everything that fails before results exist is a usage or
            // configuration problem.
            ExitCode::from(2)
        }
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Command::Daemon {
        log_file: Some(path),
        ..
    } = &args.command
    {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", path.display()),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn dispatch(args: Args) -> corelock::Result<ExitCode> {
    match args.command {
        Command::Daemon {
            port,
            max_cores,
            log_file,
        } => {
            let config = DaemonConfig {
                port,
                max_cores: max_cores.unwrap_or_else(detected_cores),
                log_file,
            };
            run_daemon(config).await
        }
        Command::Status { port } => show_status(port).await,
        Command::StopAccepting { port } => {
            let mut client = ArbiterClient::connect(port).await?;
            client.stop_accepting().await?;
            client.end().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            port,
            cores,
            priority,
            tag,
            command,
        } => run_exec(port, cores, priority, tag, command).await,
        Command::Run {
            config,
            problems,
            timeout,
            memory,
            parallelism,
            lock,
            port,
            expect,
            meta,
        } => {
            run_bench(
                config, problems, timeout, memory, parallelism, lock, port, expect, meta,
            )
            .await
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> corelock::Result<ExitCode> {
    let server = match Server::bind(config.port, config.max_cores).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(port = config.port, error = %e, "Bind failed, another daemon likely owns the port");
            return Err(e);
        }
    };

    forward_signals(server.shutdown_token());

    server.run().await?;
    Ok(ExitCode::SUCCESS)
}

async fn show_status(port: u16) -> corelock::Result<ExitCode> {
    let mut client = match ArbiterClient::connect(port).await {
        Ok(client) => client,
        Err(_) => {
            println!("no daemon listening on port {port}");
            return Ok(ExitCode::SUCCESS);
        }
    };
    let answer = client.status().await?;
    client.end().await?;

    println!("max cores: {}", answer.max_cores);
    println!("running: {}", answer.running.len());
    for job in &answer.running {
        println!(
            "  [{}] cores={} pid={} {}",
            job.id,
            job.job.cores,
            job.job.pid,
            job.job.info.as_deref().unwrap_or("")
        );
    }
    println!("waiting: {}", answer.waiting.len());
    for job in &answer.waiting {
        println!(
            "  [{}] cores={} priority={} pid={} {}",
            job.id,
            job.job.cores,
            job.job.priority,
            job.job.pid,
            job.job.info.as_deref().unwrap_or("")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_exec(
    port: u16,
    cores: i32,
    priority: i32,
    tag: Option<String>,
    command: Vec<String>,
) -> corelock::Result<ExitCode> {
    let mut client = ArbiterClient::connect_or_spawn(port).await?;
    let mut request = JobRequest::new(cores, priority).with_info(command.join(" "));
    if let Some(tag) = tag {
        request = request.with_tag(tag);
    }
    if !client.acquire(request).await? {
        eprintln!("daemon is not accepting new jobs");
        return Ok(ExitCode::from(1));
    }

    let status = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .status()
        .await?;

    client.release().await?;
    client.end().await?;
    Ok(ExitCode::from(status.code().unwrap_or(1).clamp(0, 255) as u8))
}

#[allow(clippy::too_many_arguments)]
async fn run_bench(
    config_path: PathBuf,
    problems: Vec<PathBuf>,
    timeout: Option<u64>,
    memory: Option<u64>,
    parallelism: Option<usize>,
    lock: bool,
    port: u16,
    expect: Option<String>,
    meta: Option<String>,
) -> corelock::Result<ExitCode> {
    let config = BenchConfig::load(&config_path)?;

    let mut paths = Vec::new();
    for path in problems {
        if path.is_dir() {
            paths.extend(discover_problems(&path)?);
        } else {
            paths.push(path);
        }
    }

    let expect = match expect {
        Some(word) => ExpectSource::Literal(word.parse::<Classification>()?),
        None => ExpectSource::Auto,
    };

    let options = BatchOptions {
        timeout_s: timeout.unwrap_or(config.timeout),
        memory_mb: memory.unwrap_or(config.memory),
        parallelism: parallelism.unwrap_or(config.parallelism),
        with_lock: lock,
        port,
        expect,
        default_expect: config.default_expect,
        cache_dir: config.cache_dir.clone(),
        meta,
    };

    let store = SnapshotStore::new(
        config
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("snapshots")),
    );

    let outcome = run_batch(&config.provers, &paths, &options, &store, |result| {
        println!(
            "{:8} {:7} {:6.2}s  {}",
            result.program.name,
            result.res.to_string(),
            result.raw.rtime,
            result.problem.path.display()
        );
    })
    .await?;

    let disagreements = outcome.disagreements();
    println!(
        "snapshot {}: {} events, {} disagreements, {} problems skipped",
        outcome.snapshot.uuid,
        outcome.snapshot.events.len(),
        disagreements.len(),
        outcome.missing_expect.len()
    );
    for event in &disagreements {
        println!(
            "  MISMATCH {} on {}: got {}, expected {}",
            event.program.name,
            event.problem.path.display(),
            event.res,
            event.problem.expected
        );
    }
    for path in &outcome.missing_expect {
        println!("  SKIPPED {}: expected result not found", path.display());
    }

    if outcome.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
