//! CLI subcommands

pub mod check;
pub mod root;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// One-shot update check against the registry
    Check {
        /// Image reference to check (e.g. nginx:1.24)
        image: String,

        /// Registry URL overriding the one in the reference
        #[arg(long)]
        registry: Option<String>,
    },
}
