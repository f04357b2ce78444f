use crate::config::redirect::{Redirect, RedirectConfig, RedirectSpec, STREAMS};
use crate::config::types::{PipeError, PipeMode, StdStream};
use crate::kernel::signal::install_cancel_handler;
use crate::pipe::SystemPipe;
use crate::utils::relay::Relay;
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// How long output relays may keep draining after the child exits
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a command with redirected standard streams", long_about = None)]
struct Cli {
    /// JSON redirect configuration
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Child stdin: std, pipe, file:<path> or file!:<path>
    #[arg(long, value_name = "SPEC")]
    stdin: Option<RedirectSpec>,
    /// Child stdout: std, pipe, file:<path> or file!:<path>
    #[arg(long, value_name = "SPEC")]
    stdout: Option<RedirectSpec>,
    /// Child stderr: std, pipe, file:<path> or file!:<path>
    #[arg(long, value_name = "SPEC")]
    stderr: Option<RedirectSpec>,
    /// Do not post a flush request after every write
    #[arg(long)]
    no_autoflush: bool,
    /// Command and arguments to execute
    #[arg(required = true, last = true)]
    command: Vec<String>,
}

impl Cli {
    fn redirect_config(&self) -> Result<RedirectConfig> {
        let mut config = match &self.config {
            Some(path) => RedirectConfig::load(path)?,
            None => RedirectConfig::default(),
        };

        for (stream, spec) in [
            (StdStream::Input, &self.stdin),
            (StdStream::Output, &self.stdout),
            (StdStream::Error, &self.stderr),
        ] {
            if let Some(spec) = spec {
                *config.spec_mut(stream) = spec.clone();
            }
        }
        if self.no_autoflush {
            config.autoflush = false;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Exit code for a failed run: the mapped code of a redirection failure,
/// 1 for anything else
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<PipeError>().map(i32::from).unwrap_or(1)
}

fn status_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Controller-side relay for a `pipe` slot: console stdin into the child's
/// stdin pipe, or the child's stdout/stderr pipe out to the console
fn start_relay(stream: StdStream, endpoint: Arc<SystemPipe>, autoflush: bool) -> Result<Relay> {
    let console = Arc::new(SystemPipe::open_std(stream, autoflush)?);
    let relay = match stream.child_mode() {
        PipeMode::Read => Relay::spawn(stream.name(), console, endpoint)?,
        PipeMode::Write => Relay::spawn(stream.name(), endpoint, console)?,
    };
    Ok(relay)
}

fn execute(cli: Cli) -> Result<i32> {
    install_cancel_handler()?;
    let config = cli.redirect_config()?;

    let mut redirects = Vec::with_capacity(STREAMS.len());
    for stream in STREAMS {
        let redirect = Redirect::open(config.spec(stream), stream, config.autoflush)?;
        debug!("{} -> {} ({:?})", stream, redirect.spec, redirect.endpoint);
        redirects.push(redirect);
    }

    let (program, args) = cli.command.split_first().context("no command given")?;
    // `redirects` follows STREAMS: stdin, stdout, stderr.
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::from(redirects[0].child_handle()?))
        .stdout(Stdio::from(redirects[1].child_handle()?))
        .stderr(Stdio::from(redirects[2].child_handle()?));

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program))?;
    // `Command` keeps the child's descriptors alive until dropped.
    drop(command);
    info!("Started {} (pid {})", program, child.id());

    // The child holds its ends now; keep only the controller's side.
    let mut relays = Vec::new();
    for redirect in redirects {
        let relayed = redirect.is_relayed();
        let Redirect {
            stream, endpoint, ..
        } = redirect;

        if relayed {
            endpoint.close_side(stream.child_mode())?;
            let relay = start_relay(stream, Arc::new(endpoint), config.autoflush)?;
            relays.push((stream, relay));
        } else {
            endpoint.close()?;
        }
    }

    let status = child.wait().context("failed to wait for child")?;
    info!("{} exited with {}", program, status);

    for (stream, relay) in relays {
        let moved = match stream {
            // Nobody will ever answer a stdin relay once the child is gone.
            StdStream::Input => relay.stop()?,
            StdStream::Output | StdStream::Error => relay.finish(OUTPUT_DRAIN_GRACE)?,
        };
        debug!("Relayed {} bytes on {}", moved, stream);
    }

    Ok(status_code(status))
}

/// Run the CLI and terminate the process with the child's exit code, or with
/// the mapped code of the first fatal error.
pub fn run() -> ! {
    env_logger::init();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(exit_code(&err));
        }
    }
}
