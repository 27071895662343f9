//! Gateway daemon entry point: CLI, logging, daemonization, shutdown.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

use ysf2dmr::config::Config;
use ysf2dmr::gateway::Gateway;
use ysf2dmr::VERSION;

#[derive(Parser)]
#[command(name = "ysf2dmr", disable_version_flag = true)]
struct Args {
    /// Print the version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
    /// Configuration file
    #[arg(default_value = "/etc/ysf2dmr.ini")]
    config: PathBuf,
}

fn level_for(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    }
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if config.daemon {
        let appender = tracing_appender::rolling::daily(
            &config.log_file_path,
            format!("{}.log", config.log_file_root),
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_max_level(level_for(config.log_file_level))
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level_for(config.log_display_level))
            .init();
        None
    }
}

/// Detach from the controlling terminal and drop privileges to the
/// `mmdvm` user when started as root.
#[cfg(unix)]
fn daemonize() -> anyhow::Result<()> {
    use anyhow::bail;

    // SAFETY: plain POSIX process-control calls; no Rust state is shared
    // with the short-lived parent.
    unsafe {
        match libc::fork() {
            -1 => bail!("fork failed"),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            bail!("setsid failed");
        }
        if libc::chdir(c"/".as_ptr()) == -1 {
            bail!("chdir failed");
        }
        if libc::getuid() == 0 {
            let user = libc::getpwnam(c"mmdvm".as_ptr());
            if user.is_null() {
                bail!("could not get the mmdvm user");
            }
            let uid = (*user).pw_uid;
            let gid = (*user).pw_gid;
            if libc::setgid(gid) != 0 {
                bail!("could not set the mmdvm group id");
            }
            if libc::setuid(uid) != 0 {
                bail!("could not set the mmdvm user id");
            }
            if libc::setuid(0) != -1 {
                bail!("root privileges can be regained, refusing to run");
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn close_stdio() {
    // SAFETY: the daemon never touches the standard descriptors again.
    unsafe {
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }
}

fn main() {
    let args = Args::parse();
    if args.version {
        println!("ysf2dmr version {}", VERSION);
        return;
    }

    let config = match Config::read(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ysf2dmr: {}", e);
            process::exit(1);
        }
    };

    #[cfg(unix)]
    if config.daemon {
        if let Err(e) = daemonize() {
            eprintln!("ysf2dmr: {}", e);
            process::exit(-1);
        }
    }

    let _log_guard = init_logging(&config);

    #[cfg(unix)]
    let close_after_init = config.daemon;

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.store(true, Ordering::Relaxed)) {
        error!(error = %e, "cannot install the termination handler");
    }

    let mut gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "startup failed");
            process::exit(1);
        }
    };

    #[cfg(unix)]
    if close_after_init {
        close_stdio();
    }

    if let Err(e) = gateway.run(cancel) {
        error!(error = %e, "gateway terminated");
        process::exit(1);
    }
}
