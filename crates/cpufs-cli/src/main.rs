// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! cpufs: serve trees over 9P and assemble session namespaces

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use cpufs_core::{ArchiveFs, Attacher, LocalFs, Nonce, Server, DEFAULT_MSIZE};
use cpufs_logging::{redact, CliLoggingArgs};
use cpufs_session::{Namespace, NixMounter, ProcessEnv, ServeMode, SessionConfig, TcpConnector};
use tracing::{debug, info, info_span, warn};

#[derive(Parser)]
#[command(name = "cpufs", version, about = "Serve file trees over 9P2000.L and assemble cpu namespaces")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a directory tree or a cpio archive over TCP
    Serve(ServeArgs),
    /// Print a fresh session nonce
    Nonce,
    /// Mount the remote tree and apply CPU_NAMESPACE binds
    Namespace(NamespaceArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("source").required(true).args(["root", "archive"])))]
struct ServeArgs {
    /// Directory to serve read-write
    #[arg(long)]
    root: Option<PathBuf>,

    /// newc cpio archive to serve read-only
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:17010")]
    listen: String,

    /// Require clients to send this nonce before any 9P traffic
    #[arg(long, env = "CPUNONCE", hide_env_values = true)]
    nonce: Option<String>,

    /// Largest message size offered to clients
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,
}

#[derive(Args)]
struct NamespaceArgs {
    /// Session configuration file (JSON); the environment still overrides it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mount through the FUSE gateway instead of the kernel 9p client
    #[arg(long)]
    gateway: bool,
}

fn serve(args: ServeArgs) -> Result<()> {
    let attacher: Arc<dyn Attacher> = match (args.root, args.archive) {
        (Some(root), _) => Arc::new(LocalFs::new(root)),
        (None, Some(archive)) => Arc::new(
            ArchiveFs::open(&archive)
                .with_context(|| format!("loading archive {}", archive.display()))?,
        ),
        (None, None) => bail!("one of --root or --archive is required"),
    };
    let nonce = args.nonce.filter(|n| !n.is_empty()).map(Nonce::from);
    let server = Arc::new(Server::new(attacher).with_msize(args.msize));

    let listener =
        TcpListener::bind(&args.listen).with_context(|| format!("listening on {}", args.listen))?;
    info!(
        addr = %listener.local_addr()?,
        msize = server.msize(),
        nonce = nonce.as_ref().map(redact),
        "serving 9P"
    );

    for (id, conn) in listener.incoming().enumerate() {
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        let server = server.clone();
        let nonce = nonce.clone();
        thread::Builder::new()
            .name(format!("9p-conn-{id}"))
            .spawn(move || {
                let span = info_span!("conn", id, peer = ?peer);
                let _enter = span.enter();
                let result = match &nonce {
                    Some(nonce) => server.serve_authenticated(stream, nonce),
                    None => server.serve(stream),
                };
                if let Err(e) = result {
                    debug!(error = %e, "connection ended");
                }
            })
            .context("spawning connection thread")?;
    }
    Ok(())
}

fn namespace(args: NamespaceArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path, &ProcessEnv)?,
        None => SessionConfig::from_env(&ProcessEnv)?,
    };
    if args.gateway {
        config.mode = ServeMode::Gateway;
    }
    let connector = TcpConnector { port: config.port9p.clone() };
    let mut ns = Namespace::new(config, connector, Box::new(ProcessEnv), Box::new(NixMounter));
    if let Some(warning) = ns.assemble().context("assembling namespace")? {
        eprintln!("{warning}");
    }
    if ns.has_gateway() {
        info!("gateway mounted; serving until unmounted");
        ns.wait();
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("cpufs")?;

    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Nonce => {
            println!("{}", Nonce::generate());
            Ok(())
        }
        Command::Namespace(args) => namespace(args),
    }
}
