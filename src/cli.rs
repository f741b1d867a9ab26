//! CLI surface (spec §5 "one process per role"), mirroring the original's
//! per-role entry points (`bin/lookup.py`, `bin/lookup_manager.py`,
//! `website/web/__init__.py`) as subcommands of a single binary, the way the
//! teacher crate structures its `clap` derive.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ipasnd", about = "Historical BGP prefix-to-ASN lookup fleet")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "ipasnd.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the HTTP query frontend.
    Serve,

    /// Runs a single lookup worker for one source and date window.
    Worker {
        #[arg(long)]
        source: String,
        /// ISO `first` date, e.g. `2023-06-01T00:00:00`.
        #[arg(long)]
        first: String,
        /// ISO `last` date, e.g. `2023-06-30T00:00:00`.
        #[arg(long)]
        last: String,
    },

    /// Runs the sliding-window lookup manager.
    Manager,

    /// Prints shell completions for the given shell.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}
