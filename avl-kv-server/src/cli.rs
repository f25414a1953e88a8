use std::net::IpAddr;

use clap::Parser;

use crate::{
    logging::{LogSettings, LogTarget},
    protocol::WireFormat,
    server::{DEFAULT_PORT, DEFAULT_PORT_TRIES, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "In-memory AVL-tree key-value store over TCP", long_about = None)]
pub struct Cli {
    /// Port to listen on. If it is taken, the following ports are tried.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind. Use 127.0.0.1 to accept local clients only.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Number of consecutive ports to try before giving up.
    #[arg(long, default_value_t = DEFAULT_PORT_TRIES)]
    pub port_tries: u16,

    /// Request encoding spoken by clients.
    #[arg(short, long, value_enum, default_value_t = WireFormat::Json)]
    pub format: WireFormat,

    /// Log informational events, not only errors. RUST_LOG overrides this.
    #[arg(short, long)]
    pub info: bool,

    /// Send logs to the system log instead of standard error.
    #[arg(short, long)]
    pub syslog: bool,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            port_tries: self.port_tries,
            format: self.format,
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            verbose: self.info,
            target: if self.syslog {
                LogTarget::Syslog
            } else {
                LogTarget::Stderr
            },
        }
    }
}
