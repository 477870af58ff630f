//! Process entry point: CLI parsing, logging setup, startup load, and
//! handing off to the acceptor loop (spec.md §6.1).

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use vire_core::command::{command_table, CommandCtx};
use vire_core::config::Config;
use vire_core::{manage, master, Server};

#[derive(Parser)]
#[command(
    name = "vire",
    about = "Vire - a Redis-protocol-compatible, multi-threaded in-memory key/value server",
    version
)]
struct Cli {
    /// Validate the config file and exit without starting the server
    #[arg(short = 't', long = "test-config")]
    test_config: bool,

    /// Daemonize: fork into the background and detach from the controlling terminal
    #[arg(short = 'd', long = "daemonize")]
    daemonize: bool,

    /// Print the stats dictionary (the INFO-equivalent counters) as JSON and exit
    #[arg(short = 'D', long = "dump-stats")]
    dump_stats: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'v', long = "log-level")]
    log_level: Option<String>,

    /// Write log output to this file instead of stderr
    #[arg(short = 'o', long = "log-file")]
    log_file: Option<String>,

    /// Path to the config file
    #[arg(short = 'c', long = "conf-file")]
    conf_file: Option<String>,

    /// Manage/stats endpoint port
    #[arg(short = 's', long = "manage-port")]
    manage_port: Option<u16>,

    /// Manage/stats endpoint bind address
    #[arg(short = 'a', long = "manage-addr")]
    manage_addr: Option<String>,

    /// Cron interval, in milliseconds
    #[arg(short = 'i', long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Path to write the daemon's pid file
    #[arg(short = 'p', long = "pid-file")]
    pid_file: Option<String>,

    /// Number of worker threads
    #[arg(short = 'T', long = "worker-threads")]
    worker_threads: Option<usize>,
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.conf_file {
        Some(path) => Config::load_from_file(std::path::Path::new(path))?,
        None => Config::default(),
    };
    if let Some(v) = &cli.log_level {
        config.loglevel = v.clone();
    }
    if let Some(v) = &cli.log_file {
        config.logfile = Some(v.clone());
    }
    if let Some(v) = cli.manage_port {
        config.manage_port = v;
    }
    if let Some(v) = &cli.manage_addr {
        config.manage_addr = v.clone();
    }
    if let Some(v) = cli.interval_ms {
        config.cron_interval_ms = v;
    }
    if let Some(v) = &cli.pid_file {
        config.pidfile = Some(v.clone());
    }
    if let Some(v) = cli.worker_threads {
        config.worker_threads = v;
    }
    if cli.daemonize {
        config.daemonize = true;
    }
    Ok(config)
}

fn init_logging(config: &Config) {
    let env = env_logger::Env::default().default_filter_or(config.loglevel.clone());
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(path) = &config.logfile {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("vire: failed to open log file {path}: {e}");
            }
        }
    }
    builder.init();
}

/// `fork()`+`setsid()` into the background, matching
/// `original_source/src/vr.c`'s `vr_daemonize`: double-fork so the daemon
/// can never reacquire a controlling terminal, `chdir("/")`, and redirect
/// stdio to `/dev/null`.
#[cfg(unix)]
fn daemonize() -> anyhow::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("fork() failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() < 0 {
            anyhow::bail!("setsid() failed: {}", std::io::Error::last_os_error());
        }
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        match libc::fork() {
            -1 => anyhow::bail!("fork() failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
        let root = std::ffi::CString::new("/").unwrap();
        if libc::chdir(root.as_ptr()) < 0 {
            anyhow::bail!("chdir(\"/\") failed: {}", std::io::Error::last_os_error());
        }
        let devnull_path = std::ffi::CString::new("/dev/null").unwrap();
        let devnull = libc::open(devnull_path.as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}

fn write_pidfile(path: &str) -> anyhow::Result<()> {
    let mut f = std::fs::File::create(path)?;
    writeln!(f, "{}", std::process::id())?;
    Ok(())
}

/// Replays one command logged by the append-log or found in an RDB's
/// companion AOF files, dispatching it through the real handler so shard
/// routing and propagation side effects are re-derived rather than trusted
/// from the log (spec.md §4.5 "Load"). Bypasses `handle_command`'s
/// auth/`MULTI` gating and `execute`'s log-append step — both are
/// meaningless for a command that is itself being replayed from the log.
fn replay_command(server: &Server, db: usize, argv: Vec<Vec<u8>>) {
    if argv.is_empty() {
        return;
    }
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    let Some(spec) = command_table().get(name.as_str()).copied() else {
        log::warn!("replay: unknown command '{name}', skipping");
        return;
    };
    let mut client = vire_core::client::Client::new(0, 0, "0.0.0.0:0".parse().unwrap(), false);
    client.db_index = db;
    client.argv = argv;
    let mut ctx = CommandCtx { server, client: &mut client, propagate_override: None };
    (spec.handler)(&mut ctx);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if cli.test_config {
        println!("vire: configuration file is valid");
        return Ok(0);
    }

    init_logging(&config);

    if cli.daemonize {
        #[cfg(unix)]
        daemonize()?;
        #[cfg(not(unix))]
        log::warn!("daemonize requested but this platform has no fork(); ignoring");
    }
    if let Some(path) = &config.pidfile {
        write_pidfile(path)?;
    }

    let server = Arc::new(Server::new(config));

    if let Err(e) = server.persistence.load_all(&server.keyspace, |db, argv| {
        replay_command(&server, db, argv);
    }) {
        log::error!("startup load failed: {e}");
        return Ok(1);
    }

    if cli.dump_stats {
        let snapshot = server.stats.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(0);
    }

    manage::spawn(Arc::clone(&server))?;
    master::run(server)?;
    Ok(0)
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("vire: {e}");
            std::process::exit(1);
        }
    }
}
