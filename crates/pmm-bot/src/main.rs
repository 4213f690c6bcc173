//! pmmbot entry point and CLI dispatch.

use clap::Parser;
use pmm_bot::{commands, config::BotConfig, control, logging, App};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pmmbot", version, about = "Automated market-making service")]
struct Args {
    /// Dry run: wrap every broker in the exchange emulator.
    #[arg(short = 't', long)]
    dry_run: bool,

    /// Configuration file.
    #[arg(short, long, default_value = "pmmbot.toml")]
    config: PathBuf,

    /// Verbose logging. Not available in daemon mode.
    #[arg(short, long)]
    verbose: bool,

    /// Command: run, start, stop, restart, status, pidof, wait,
    /// logrotate, calc_range, get_all_pairs, erase_trade,
    /// resync_trades_from, reset, achieve, repair, backtest.
    cmd: String,

    /// Command arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return 1;
        }
    };

    match args.cmd.as_str() {
        "run" => run_service(&args),
        "start" => start_daemon(&args),
        "stop" => {
            let code = remote_command(&args, "stop", &[]);
            if code == 0 {
                wait_for_exit(&args);
            }
            code
        }
        "restart" => {
            let _ = remote_command(&args, "stop", &[]);
            wait_for_exit(&args);
            start_daemon(&args)
        }
        "status" => match try_remote(&args, "status", &[]) {
            Some(code) => code,
            None => {
                println!("not running");
                2
            }
        },
        "pidof" => pidof(&args),
        "wait" => {
            wait_for_exit(&args);
            0
        }
        cmd => {
            // Admin commands go to the running daemon when there is
            // one, otherwise run against a one-shot local context.
            match try_remote(&args, cmd, &args.args) {
                Some(code) => code,
                None => local_command(&args, cmd),
            }
        }
    }
}

fn load_config(args: &Args) -> Result<BotConfig, i32> {
    BotConfig::load(&args.config).map_err(|e| {
        eprintln!("Error: {e}");
        2
    })
}

/// Foreground service: build the context, bind the control socket,
/// install the ticks, and wait for stop.
fn run_service(args: &Args) -> i32 {
    logging::init_logging(args.verbose);
    logging::install_crash_handler();

    let cfg = match load_config(args) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let pid_file = cfg.pid_file();
    let socket_path = cfg.socket_path();

    let app = match App::new(cfg, args.dry_run) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };

    if let Some(parent) = pid_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&pid_file, format!("{}\n", std::process::id())) {
        eprintln!("Error: cannot write pid file {}: {e}", pid_file.display());
        return 3;
    }
    let control = match control::serve(app.clone(), &socket_path) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: cannot bind control socket: {e}");
            let _ = std::fs::remove_file(&pid_file);
            return 3;
        }
    };

    info!("---- starting service ----");
    app.start_ticks();
    app.wait_for_stop();
    app.shutdown();

    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_file);
    drop(control);
    0
}

/// Spawn `run` detached. Supervision belongs to the init system.
fn start_daemon(args: &Args) -> i32 {
    if args.verbose {
        eprintln!("Verbose is not available in daemon mode");
        return 100;
    }
    if load_config(args).is_err() {
        return 2;
    }
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("Error: {e}");
            return 3;
        }
    };
    let mut cmd = Command::new(exe);
    cmd.arg("-c").arg(&args.config).arg("run");
    if args.dry_run {
        cmd.arg("-t");
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    match cmd.spawn() {
        Ok(child) => {
            println!("{}", child.id());
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return 3;
        }
    }
}

fn pidof(args: &Args) -> i32 {
    let cfg = match load_config(args) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    match std::fs::read_to_string(cfg.pid_file()) {
        Ok(pid) => {
            println!("{}", pid.trim());
            0
        }
        Err(_) => {
            eprintln!("not running");
            2
        }
    }
}

/// Poll until the control socket stops answering.
fn wait_for_exit(args: &Args) {
    let Ok(cfg) = load_config(args) else { return };
    let socket = cfg.socket_path();
    while std::os::unix::net::UnixStream::connect(&socket).is_ok() {
        std::thread::sleep(Duration::from_millis(500));
    }
}

/// Send a command to the running daemon; `None` when it is not
/// reachable.
fn try_remote(args: &Args, cmd: &str, cmd_args: &[String]) -> Option<i32> {
    let cfg = load_config(args).ok()?;
    let mut stdout = std::io::stdout();
    control::send_command(&cfg.socket_path(), cmd, cmd_args, &mut stdout).ok()
}

fn remote_command(args: &Args, cmd: &str, cmd_args: &[String]) -> i32 {
    match try_remote(args, cmd, cmd_args) {
        Some(code) => code,
        None => {
            eprintln!("Service is not running");
            2
        }
    }
}

/// Run one admin command against a freshly built local context, for
/// use when no daemon is running.
fn local_command(args: &Args, cmd: &str) -> i32 {
    logging::init_logging(args.verbose);
    let cfg = match load_config(args) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let app = match App::new(cfg, args.dry_run) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };
    let mut stdout = std::io::stdout();
    let code = commands::execute(&app, cmd, &args.args, &mut stdout);
    let _ = stdout.flush();
    app.shutdown();
    code
}
