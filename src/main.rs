mod anchors;
mod cli;
mod config;
mod daemon_config;
mod elastic_buffer;
mod error;
mod exec_template;
mod handles;
mod inode_table;
mod logging;
mod overlay;
mod render;

use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fuser::Session;

use cli::{parse_mount_options, Cli, OptionError};
use daemon_config::DaemonConfig;
use overlay::TemplateFs;

/// spec.md §6 exit codes, reproduced verbatim as the mapping this daemon
/// commits to (SPEC_FULL §4.F); the boundary between "session construction
/// failed" (3) and "mount failed" (4) is this daemon's own call, recorded
/// in DESIGN.md: everything up to and including building the `TemplateFs`
/// value is "construction"; the `fuser::Session::new` syscall-level mount
/// itself is "mount".
#[derive(Debug)]
enum ExitReason {
    CommonOptionParse,
    MissingMountpointOrTemplates,
    SessionConstructionFailed,
    MountFailed,
    SignalHandlerFailed,
    EventLoopFailed,
    TemplateOptionParse,
}

impl ExitReason {
    fn code(&self) -> u8 {
        match self {
            ExitReason::CommonOptionParse => 1,
            ExitReason::MissingMountpointOrTemplates => 2,
            ExitReason::SessionConstructionFailed => 3,
            ExitReason::MountFailed => 4,
            // 5 (daemonize failed) is reserved: this daemon never daemonizes.
            ExitReason::SignalHandlerFailed => 6,
            ExitReason::EventLoopFailed => 7,
            ExitReason::TemplateOptionParse => 8,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => ExitReason::CommonOptionParse.code(),
            };
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err((reason, err)) => {
            log::error!("{:?}", err);
            ExitCode::from(reason.code())
        }
    }
}

fn run(cli: Cli) -> Result<(), (ExitReason, anyhow::Error)> {
    let parsed_options = parse_mount_options(&cli.options).map_err(|e| match e {
        OptionError::TemplatesMissing => (
            ExitReason::MissingMountpointOrTemplates,
            anyhow::anyhow!("missing required -o templates=<path> option"),
        ),
        OptionError::TemplatesMalformed(entry) => (
            ExitReason::TemplateOptionParse,
            anyhow::anyhow!("malformed templates option: {entry:?}"),
        ),
        OptionError::Unrecognized(key) => (
            ExitReason::CommonOptionParse,
            anyhow::anyhow!("unrecognized mount option: {key:?}"),
        ),
    })?;

    if !cli.mountpoint.is_dir() {
        return Err((
            ExitReason::MissingMountpointOrTemplates,
            anyhow::anyhow!("mountpoint {:?} does not exist or is not a directory", cli.mountpoint),
        ));
    }

    let daemon_config = DaemonConfig::load_or_default(cli.config.as_ref())
        .context("failed to load daemon configuration")
        .map_err(|e| (ExitReason::SessionConstructionFailed, e))?;

    logging::init(&daemon_config.logging, daemon_config.logging.level == daemon_config::LogLevel::Debug)
        .context("failed to initialize logging")
        .map_err(|e| (ExitReason::SessionConstructionFailed, e))?;

    log::info!("mounting templatefs at {:?} (templates={:?})", cli.mountpoint, parsed_options.templates);

    let mount_anchor = anchors::setup_tree(&cli.mountpoint)
        .with_context(|| format!("invalid mountpoint {:?}", cli.mountpoint))
        .map_err(|e| (ExitReason::MissingMountpointOrTemplates, e))?;
    let template_anchor = anchors::setup_tree(&parsed_options.templates)
        .with_context(|| format!("invalid templates path {:?}", parsed_options.templates))
        .map_err(|e| (ExitReason::MissingMountpointOrTemplates, e))?;

    let store_path = cli.config_store.as_ref().or(daemon_config.config_store_path.as_ref());
    let config_store = config::load_or_empty(store_path)
        .context("failed to load config store document")
        .map_err(|e| (ExitReason::SessionConstructionFailed, e))?;

    let environment = exec_template::captured_environment();
    let poll_timeout = Duration::from_secs(daemon_config.exec_poll_timeout_secs);

    let filesystem = TemplateFs::new(
        mount_anchor,
        template_anchor,
        Box::new(config_store),
        environment,
        poll_timeout,
    );

    let options = parsed_options.fuse_options;
    // `fuser::Session::run` already processes one kernel request at a time on
    // the calling thread; `-s`/`--single-thread` is this daemon's only mode,
    // so the flag is accepted (for command-line compatibility with other
    // FUSE daemons) but does not change behavior.
    let _ = cli.single_thread;
    let _ = cli.foreground; // this daemon never daemonizes regardless of this flag

    run_session(filesystem, &cli.mountpoint, &options)
}

/// Owns the `fuser::Session` lifecycle: construct, mount, run to
/// completion, and unmount cleanly on SIGTERM/SIGINT (spec.md §6 scenario
/// 6: "...unmounts cleanly on SIGTERM").
fn run_session(
    filesystem: TemplateFs,
    mountpoint: &Path,
    options: &[fuser::MountOption],
) -> Result<(), (ExitReason, anyhow::Error)> {
    let mut session = Session::new(filesystem, mountpoint, options)
        .context("failed to mount fuse session")
        .map_err(|e| (ExitReason::MountFailed, e))?;
    let mut unmounter = session.unmount_callable();

    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .context("failed to install signal handler")
            .map_err(|e| (ExitReason::SignalHandlerFailed, e))?;
    }

    // Detached: if the kernel session ends on its own (e.g. an external
    // `fusermount -u`) this thread just notices `run()` already returned and
    // exits on its next poll; it must not be joined, or a mount that never
    // receives SIGTERM/SIGINT would hang the process forever waiting for it.
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
        }
        log::info!("signal received, unmounting");
        let _ = unmounter.unmount();
    });

    let result = session.run();

    match result {
        Ok(()) => Ok(()),
        Err(e) => Err((ExitReason::EventLoopFailed, anyhow::anyhow!(e).context("fuse event loop failed"))),
    }
}
