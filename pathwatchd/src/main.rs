//! `pathwatchd` — Supervisor entry point (§4.8).
//!
//! Builds watches, indexes the configured roots, and runs the Connection
//! multiplexer. On drift (kernel queue overflow or any other fatal
//! condition propagated from a generation) the tree and watches are torn
//! down and the whole thing is retried after an exponentially growing
//! backoff, starting at 5s and capped at 300s.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::stream::{FuturesUnordered, StreamExt};
use inotify::Inotify;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;
use tokio::net::UnixListener;

mod client_buffer;
mod dispatcher;
mod indexer;
mod path_util;
mod rename_table;
mod trace;
mod tree;
mod watch;

use client_buffer::ClientBuffer;
use dispatcher::{BatchOutcome, EventDispatcher};
use pathwatch_common::DEFAULT_SOCKET;
use tree::NodeRef;
use watch::WatchManager;

/// The connection multiplexer refuses more than this many concurrent
/// clients rather than risk starving event processing (§4.6).
const MAX_CLIENTS: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const INOTIFY_BUFFER_LEN: usize = 4096;

#[derive(Parser, Debug)]
#[command(
    name = "pathwatchd",
    version,
    about = "Live substring search over one or more watched filesystem subtrees"
)]
struct Opts {
    /// Filesystem paths to index and watch
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Enable per-event trace output
    #[arg(short, long)]
    debug: bool,

    /// Suppress recurring per-node error reports
    #[arg(short, long)]
    quiet: bool,

    /// Override the socket location
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

impl Opts {
    fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Broken pipes from premature client disconnects must not kill the
    // process (§5 Signal policy). Installed once, before anything else.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(why) => {
            let is_help = matches!(
                why.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            why.print().ok();
            std::process::exit(if is_help { 0 } else { 1 });
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if opts.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    if let Err(why) = run(opts).await {
        log::error!("fatal: {}", why);
        std::process::exit(1);
    }
}

/// Outer Supervisor loop: build, run, and on Drift (the only in-process-
/// recoverable condition, §7) tear down and retry with backoff. Every
/// other error out of a generation is Fatal — inotify init failure, an
/// unrecoverable read on the event stream or the listening socket, error
/// readiness on either, path-length overflow during indexing — and is
/// propagated to `main()` to abort the process rather than retried here;
/// an external supervisor is expected to restart it (§7).
async fn run(opts: Opts) -> anyhow::Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match run_generation(&opts, &mut signals).await {
            Ok(GenerationOutcome::Shutdown) => {
                log::info!("termination signal received, shutting down");
                let _ = fs::remove_file(&opts.socket_path());
                return Ok(());
            }
            Ok(GenerationOutcome::Drift) => {
                log::error!(
                    "lost synchronization with the filesystem; re-indexing in {}s",
                    backoff.as_secs()
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(why) => return Err(why),
        }
    }
}

enum GenerationOutcome {
    Drift,
    Shutdown,
}

/// One full life of the tree: initialise inotify, index every configured
/// root, then hand off to the multiplexer loop.
async fn run_generation(opts: &Opts, signals: &mut Signals) -> anyhow::Result<GenerationOutcome> {
    let inotify = Inotify::init().map_err(|why| anyhow::anyhow!("failed to initialize inotify: {}", why))?;
    let mut watch_mgr = WatchManager::new(inotify.watches(), opts.quiet);
    let mut dispatcher = EventDispatcher::new(opts.debug, opts.quiet);
    let root = tree::new_root();
    let mut stream = inotify.into_event_stream(vec![0u8; INOTIFY_BUFFER_LEN])?;

    for path in &opts.paths {
        let started = Instant::now();
        match indexer::index_from(&root, path, &mut watch_mgr, &mut dispatcher, &mut stream).await? {
            indexer::IndexOutcome::Done => {
                log::info!("indexed {} in {:?}", path.display(), started.elapsed());
            }
            indexer::IndexOutcome::Drift => return Ok(GenerationOutcome::Drift),
        }
    }

    let socket_path = opts.socket_path();
    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .map_err(|why| anyhow::anyhow!("failed to bind {}: {}", socket_path.display(), why))?;
    log::info!("listening on {}", socket_path.display());

    run_multiplexer(&root, &mut watch_mgr, &mut dispatcher, &mut stream, &listener, signals).await
}

/// The Connection multiplexer (§4.6): fairly multiplexes the inotify event
/// stream, the listening socket, termination signals, and every connected
/// client off of one `current_thread` task — the tokio analogue of a
/// single level-triggered `poll()` set.
async fn run_multiplexer(
    root: &NodeRef,
    watch_mgr: &mut WatchManager,
    dispatcher: &mut EventDispatcher,
    stream: &mut inotify::EventStream<Vec<u8>>,
    listener: &UnixListener,
    signals: &mut Signals,
) -> anyhow::Result<GenerationOutcome> {
    let mut clients: Vec<ClientBuffer> = Vec::new();

    loop {
        tokio::select! {
            biased;

            Some(_) = signals.next() => {
                return Ok(GenerationOutcome::Shutdown);
            }

            maybe_event = stream.next() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        match dispatcher.process_event(root, watch_mgr, stream, event).await? {
                            BatchOutcome::Drift => return Ok(GenerationOutcome::Drift),
                            BatchOutcome::Clean => {}
                        }
                    }
                    Some(Err(why)) => anyhow::bail!("error reading the inotify event stream: {}", why),
                    None => anyhow::bail!("inotify event stream ended unexpectedly"),
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, _addr)) => {
                        if clients.len() >= MAX_CLIENTS {
                            log::warn!("rejecting connection: already at the {}-client cap", MAX_CLIENTS);
                            drop(conn);
                        } else {
                            clients.push(ClientBuffer::new(conn));
                        }
                    }
                    Err(why) => anyhow::bail!("error accepting a connection: {}", why),
                }
            }

            Some((idx, outcome)) = poll_any_client(&mut clients, root), if !clients.is_empty() => {
                if outcome == client_buffer::Outcome::Close {
                    clients.remove(idx);
                }
            }
        }
    }
}

/// Races every connected client's next read against the others, resolving
/// as soon as one of them has something to report. A level-triggered
/// descriptor set would instead report every ready descriptor per wakeup;
/// racing one at a time still gives every client forward progress and
/// keeps this arm's future a plain, cancel-safe `Future` the `select!`
/// above can re-poll freely.
async fn poll_any_client(
    clients: &mut [ClientBuffer],
    root: &NodeRef,
) -> Option<(usize, client_buffer::Outcome)> {
    if clients.is_empty() {
        return None;
    }
    let mut pending: FuturesUnordered<_> = clients
        .iter_mut()
        .enumerate()
        .map(|(idx, client)| async move { (idx, client.service(root).await) })
        .collect();
    pending.next().await
}
