//! Process lifecycle around the daemon: PID files, port preflight, the
//! binary-upgrade watcher and the one-shot CLI operations.

pub mod commands;
pub mod pid;
pub mod preflight;
pub mod upgrade;
