//! `pathwatch-client` — the thin query client (explicitly out of scope for
//! the daemon's core: spec §1). Connects to the daemon's UNIX socket,
//! writes one line containing the search substring, and prints every line
//! of the response up to (but not including) the trailing blank line.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::Parser;
use pathwatch_common::DEFAULT_SOCKET;

#[derive(Parser)]
#[command(version, about = "Query a running pathwatchd for paths containing a substring")]
struct Opts {
    /// Search substring; empty matches every indexed path
    #[arg(default_value = "")]
    query: String,

    /// Socket of the pathwatchd instance to query
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

trait ExitWithError<T> {
    fn exit_on_err(self, msg: &str) -> T;
}

impl<T, E: std::fmt::Display> ExitWithError<T> for Result<T, E> {
    fn exit_on_err(self, msg: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                eprintln!("pathwatch-client: {}: {}", msg, e);
                std::process::exit(1);
            }
        }
    }
}

fn main() {
    env_logger::init();
    let opts = Opts::parse();
    let socket = opts
        .socket
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));
    log::debug!("querying {} for {:?}", socket.display(), opts.query);

    let mut stream = UnixStream::connect(&socket)
        .exit_on_err(&format!("failed to connect to {}", socket.display()));

    stream
        .write_all(opts.query.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .exit_on_err("failed to send query");

    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).exit_on_err("failed to read response");
        if n == 0 {
            break; // daemon closed the connection
        }
        if line == "\n" {
            break; // end-of-results marker
        }
        print!("{}", line);
    }
    io::stdout().flush().ok();
}
