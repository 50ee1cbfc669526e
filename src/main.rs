use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tftpeer::tftp::client::{client_main, ClientConfig};
use tftpeer::tftp::server::{ServerConfig, TFTPServer};
use tftpeer::tftp::shared::data_channel::ChannelConfig;
use tftpeer::tftp::shared::Endianness;

/// This doc string acts as a help message when the user runs '--help'
/// as do all doc strings on fields
#[derive(Parser, Debug)]
#[command(version = "1.0", author = "shakram02")]
struct Opts {
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// act as a TFTP client.
    #[command(name = "client")]
    Client(ClientOperations),
    /// act as a TFTP server.
    #[command(name = "server")]
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// IP for the server to use.
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1")]
    address: String,
    /// UDP port that the server will listen on.
    #[arg(short = 'p', long = "port", default_value_t = 69)]
    port: u16,
    /// Directory files are served from and stored to.
    #[arg(short = 'r', long = "root", default_value = ".")]
    root: String,
    #[command(flatten)]
    timing: TimingArgs,
}

/// A subcommand for controlling testing
#[derive(Args, Debug)]
struct ClientOperations {
    /// name of the file to be downloaded.
    filename: String,
    /// If specified tftpeer will attempt to upload the input file
    #[arg(short = 'u', long = "upload")]
    upload: bool,
    /// Server bind address
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1")]
    address: String,
    /// Server bind port
    #[arg(short = 'p', long = "port", default_value_t = 69)]
    port: u16,
    /// Byte order of the packets sent to the server.
    #[arg(short = 'b', long = "byte-order", value_enum, default_value_t = ByteOrder::Big)]
    byte_order: ByteOrder,
    #[command(flatten)]
    timing: TimingArgs,
}

#[derive(Args, Debug)]
struct TimingArgs {
    /// Milliseconds to wait for the peer before retransmitting.
    #[arg(long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,
    /// Retransmissions before a transfer is abandoned.
    #[arg(long = "retries", default_value_t = 8)]
    retries: u32,
}

impl TimingArgs {
    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.retries,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ByteOrder {
    Big,
    Little,
}

impl From<ByteOrder> for Endianness {
    fn from(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Big => Endianness::Big,
            ByteOrder::Little => Endianness::Little,
        }
    }
}

#[async_std::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts: Opts = Opts::parse();
    match opts.subcmd {
        SubCommand::Client(client_args) => {
            let addr = format!("{}:{}", client_args.address, client_args.port);
            if client_args.upload {
                info!("[UPLOAD] FILE: ({}) TO SERVER: {}", client_args.filename, addr);
            } else {
                info!("[DOWNLOAD] FILE: ({}) SERVER: {}", client_args.filename, addr);
            }

            let config = ClientConfig {
                order: client_args.byte_order.into(),
                channel: client_args.timing.channel_config(),
            };
            client_main(addr.as_str(), &client_args.filename, client_args.upload, config).await?;
        }
        SubCommand::Server(server_args) => {
            let config = ServerConfig {
                root: server_args.root.clone().into(),
                channel: server_args.timing.channel_config(),
            };
            let addr = (server_args.address.as_str(), server_args.port);
            let server = TFTPServer::bind(addr, config).await?;
            server.run().await?;
        }
    };

    Ok(())
}
