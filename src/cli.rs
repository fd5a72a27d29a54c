//! CLI entrypoint wiring for the capmux binary.
//!
//! The `serve` subcommand is the canonical caller of the core: it raises
//! cap_net_bind_service only long enough to bind a privileged port, then
//! restores the original state before serving traffic. Set it up with:
//!
//! ```text
//! cargo build --release
//! sudo setcap cap_net_bind_service=p target/release/capmux
//! target/release/capmux serve --port 80
//! ```

use crate::bits::Capability;
use crate::broadcast::{self, Mode};
use crate::proc;
use crate::set::Flag;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Process-wide Linux capability management", long_about = None)]
struct Cli {
    /// Commit capability changes in the calling thread only. Correct only
    /// for programs that never run a second OS thread.
    #[arg(long)]
    single_thread: bool,

    /// Broadcast rendezvous timeout in milliseconds (default: wait forever)
    #[arg(long)]
    sync_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current process capability state
    Status {
        /// Emit the state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Minimal web server demonstrating privileged-port binding
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: u16,
        /// Bind without raising the effective capability (fails for low
        /// ports), then drop all capabilities before serving
        #[arg(long)]
        no_elevate: bool,
    },
}

/// Refuse to run setuid-something or as root: the supported setup is file
/// capabilities on an unprivileged binary, and anything else means the
/// operator prepared the program incorrectly.
fn bootstrap_guard() -> Result<()> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    let (uid, euid) = (getuid(), geteuid());
    let (gid, egid) = (getgid(), getegid());
    if uid != euid || gid != egid {
        bail!(
            "running setuid: uids ({} vs {}), gids ({} vs {})",
            uid,
            euid,
            gid,
            egid
        );
    }
    if uid.is_root() {
        bail!("running as root defeats the point of capability binding");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mode = if cli.single_thread {
        Mode::SingleThread
    } else {
        Mode::Broadcast {
            timeout: cli.sync_timeout_ms.map(Duration::from_millis),
        }
    };
    broadcast::init(mode);

    match cli.command {
        Commands::Status { json } => status(json),
        Commands::Serve { port, no_elevate } => {
            bootstrap_guard()?;
            serve(port, no_elevate)
        }
    }
}

fn status(json: bool) -> Result<()> {
    let caps = proc::current().context("reading process capability state")?;
    let named = |select: &dyn Fn(Capability) -> bool| -> Vec<String> {
        (0..=crate::kernel::cap_last_cap())
            .filter_map(Capability::from_index)
            .filter(|cap| select(*cap))
            .map(|cap| cap.to_string())
            .collect()
    };
    let effective = named(&|cap| caps.get_flag(Flag::Effective, cap));
    let permitted = named(&|cap| caps.get_flag(Flag::Permitted, cap));
    let inheritable = named(&|cap| caps.get_flag(Flag::Inheritable, cap));
    let ambient = named(&|cap| caps.get_ambient(cap));

    if json {
        let state = serde_json::json!({
            "effective": effective,
            "permitted": permitted,
            "inheritable": inheritable,
            "ambient": ambient,
        });
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("{}", caps);
        for (label, names) in [
            ("effective", effective),
            ("permitted", permitted),
            ("inheritable", inheritable),
            ("ambient", ambient),
        ] {
            if names.is_empty() {
                println!("{}: (none)", label);
            } else {
                println!("{}: {}", label, names.join(","));
            }
        }
    }
    Ok(())
}

fn serve(port: u16, no_elevate: bool) -> Result<()> {
    let address = format!("0.0.0.0:{}", port);
    let listener = if no_elevate {
        let listener = TcpListener::bind(&address)
            .with_context(|| format!("binding {} without elevation", address))?;
        proc::drop_all().context("dropping capabilities")?;
        listener
    } else {
        let caps = proc::current()?;
        if !caps.get_flag(Flag::Permitted, Capability::NetBindService) {
            bail!(
                "insufficient privilege to bind low ports - want {}, have {}",
                Capability::NetBindService,
                caps
            );
        }
        proc::with_temporary_elevation(Flag::Effective, Capability::NetBindService, || {
            TcpListener::bind(&address)
        })
        .context("raising cap_net_bind_service")?
        .with_context(|| format!("binding {}", address))?
    };

    log::info!("listening on {}", address);
    for connection in listener.incoming() {
        let stream = connection.context("accepting connection")?;
        broadcast::spawn(move || {
            if let Err(e) = answer(stream) {
                log::warn!("failed to answer request: {}", e);
            }
        });
    }
    Ok(())
}

/// Report pid, kernel thread id and capability state for this connection, so
/// a client can watch the work bounce across threads that all agree on the
/// committed capability state.
fn answer(mut stream: TcpStream) -> Result<()> {
    let pid = std::process::id();
    // SAFETY: gettid(2) takes no arguments and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let caps = proc::current()?;
    log::info!("saying hello from proc {}->{}, caps={}", pid, tid, caps);
    write!(
        stream,
        "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nHello from proc {}->{}, caps={}\n",
        pid, tid, caps
    )?;
    Ok(())
}
