use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, serving the WebSocket endpoint and the browser client.
    Serve(ServeArgs),
    /// Connect to a relay from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Directory of static files served next to the WebSocket endpoint.
    #[arg(long, default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/public"))]
    pub static_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name to claim on login.
    #[arg(long)]
    pub name: String,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    pub server: String,
}
