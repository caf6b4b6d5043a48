mod buffd;
mod cli;
mod conf;
mod dependency;
mod error;
mod exec;
mod handler;
mod lock;
mod logging;
mod registry;
mod service;
mod status;
mod supervisor;
#[cfg(test)]
mod testutil;
mod watcher;

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{error, info};

use crate::{
    buffd::BufFd,
    cli::Cli,
    conf::Config,
    dependency::{Dependencies, SelfSpawner},
    error::{Error, Result},
    handler::Command,
    lock::{Lock, Probe},
    service::{ForkLauncher, ENTRY_POINT},
    status::{ServiceState, Status, StatusDir},
    supervisor::Supervisor,
    watcher::Watcher,
};

const SUPERVISE_DIR: &str = "supervise";

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::AlreadySupervised(dir)) => {
            info!("{} is already supervised, exiting", dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.probe {
        return probe(&cli.dir);
    }

    // resolved before the working directory changes
    let config_path = cli.config.as_deref().map(fs::canonicalize).transpose()?;
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let dir = fs::canonicalize(&cli.dir)?;
    let svdir = match env::var_os("SVDIR") {
        Some(root) => PathBuf::from(root),
        None => {
            let root = dir.parent().unwrap_or(&dir).to_path_buf();
            env::set_var("SVDIR", &root);
            root
        }
    };
    let exe = exec::resolve_self();

    env::set_current_dir(&dir)?;
    fs::create_dir_all(SUPERVISE_DIR)?;

    // a dependent that went away must not kill us through a write
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;

    let lock = Lock::acquire(&Path::new(SUPERVISE_DIR).join("lock")).map_err(|e| match e {
        Error::AlreadySupervised(_) => Error::AlreadySupervised(dir.clone()),
        e => e,
    })?;
    info!(
        lock = %lock.path().display(),
        dependency = cli.dependency,
        "supervising {}",
        dir.display()
    );

    let watcher = Watcher::new()?;
    let control_path = Path::new(SUPERVISE_DIR).join("control");
    let mut control = BufFd::fifo(&control_path).map_err(|source| Error::Control {
        path: control_path.clone(),
        source,
    })?;
    let ok_path = Path::new(SUPERVISE_DIR).join("ok");
    let _ok = BufFd::fifo(&ok_path).map_err(|source| Error::Control {
        path: ok_path.clone(),
        source,
    })?;

    let timing = config.timing;
    let spawner = SelfSpawner::new(&exe, config_path.as_deref())?;
    let deps = Dependencies::new(&dir, &svdir, Box::new(spawner), timing.clone());
    let launcher = ForkLauncher::new(ENTRY_POINT)?;
    let state = ServiceState::new(Box::new(StatusDir::new(SUPERVISE_DIR)));

    let mut supervisor = Supervisor::new(state, deps, Box::new(launcher), watcher, timing);
    supervisor.set_status(Status::Waiting);
    if !cli.dependency {
        supervisor.apply(Command::Start);
    }

    let outcome = supervisor.run(&mut control);
    lock.release()?;
    outcome
}

fn probe(dir: &Path) -> Result<()> {
    let supervised = match lock::test(&dir.join(SUPERVISE_DIR).join("lock"))? {
        Probe::Locked => true,
        Probe::Unlocked | Probe::NotFound => false,
    };
    println!("{}", status::describe(dir, supervised));
    Ok(())
}
