use clap::{Args, Parser, Subcommand};

use crate::config::OverflowPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections and relaying every line to all clients.
    Serve(ServeArgs),
    /// Connect to a relay, sending stdin lines and printing everything it relays.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host and port the relay should listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "localhost:8000")]
    pub listen: String,

    /// Messages buffered per client before the overflow policy kicks in.
    #[arg(long, env = "CHAT_RELAY_QUEUE_CAPACITY", default_value_t = 64)]
    pub queue_capacity: usize,

    /// Events buffered in front of the broadcaster before readers wait.
    #[arg(long, env = "CHAT_RELAY_INTAKE_CAPACITY", default_value_t = 1024)]
    pub intake_capacity: usize,

    /// What to do with a client whose queue is full.
    #[arg(
        long,
        env = "CHAT_RELAY_ON_OVERFLOW",
        value_enum,
        default_value_t = OverflowPolicy::Disconnect
    )]
    pub on_overflow: OverflowPolicy,

    /// Disconnect clients that send nothing for this many seconds.
    #[arg(long, env = "CHAT_RELAY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Do not echo a client's own lines back to it.
    #[arg(long, env = "CHAT_RELAY_NO_ECHO")]
    pub no_echo: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Host and port of the relay to connect to.
    #[arg(long, default_value = "localhost:8000")]
    pub server: String,
}
