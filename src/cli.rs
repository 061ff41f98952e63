use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use tapmux::config::DEFAULT_CONFIG_PATH;

#[derive(Debug, Parser)]
#[command(
    name = "tapmux",
    version,
    about = "Layered keyboard remapping for evdev devices"
)]
pub struct Cli {
    /// Path to the config file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Log device decisions and every key press
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Exit after N seconds (for testing)
    #[arg(long, value_name = "N", global = true)]
    pub timeout: Option<u64>,

    /// Notify systemd when the service is ready
    #[arg(long, global = true)]
    pub systemd: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Grab matching keyboards and remap them into a virtual device
    Local,
    /// Grab matching keyboards and serve translated events over TCP
    Serve {
        /// Port to listen on
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
    /// Replay events from a tapmux server into a local virtual device
    Connect {
        host: String,
        port: u16,
    },
    /// List input devices and the grab verdict for each
    List,
    /// Generate shell completions
    Completion {
        shell: Shell,
    },
}

pub fn print_help() {
    let _ = Cli::command().print_help();
    println!();
}

pub fn generate_completion(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}
