//! Shared bits between the `pathwatchd` daemon and the `pathwatch-client` query tool.
//!
//! The wire protocol itself (newline-delimited query in, newline-delimited
//! paths + blank line out) needs no shared types — it's plain text — so this
//! crate only carries the socket default both binaries agree on.

/// Default location of the daemon's UNIX domain socket, overridable with
/// `-s/--socket` on the daemon and the client alike.
pub const DEFAULT_SOCKET: &str = "./socket";
