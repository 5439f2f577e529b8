use clap::{Parser, Subcommand};

/// stinger — policy enforcement and audit layer for conversational AI
#[derive(Parser)]
#[command(name = "stinger", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default when no subcommand is given)
    Serve {
        /// Port to bind, overriding STINGER_PORT
        #[arg(short, long)]
        port: Option<u16>,

        /// Guardrail preset to load by default, overriding STINGER_PRESET
        #[arg(long)]
        preset: Option<String>,
    },
}
