use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use anyhow::{Context, Result};
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader,
    },
    net::{TcpListener, TcpSocket},
    select,
};
use tracing::{debug, error, info, warn};

use crate::{
    Store,
    protocol::{self, MAX_REQUEST_LEN, RequestError, WireFormat},
};

pub const DEFAULT_PORT: u16 = 45234;
pub const DEFAULT_PORT_TRIES: u16 = 10;
pub const LISTEN_BACKLOG: u32 = 10;

/// Where and how the server listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// First candidate port; 0 lets the OS pick.
    pub port: u16,
    /// How many consecutive ports to try, starting at `port`.
    pub port_tries: u16,
    pub format: WireFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            port_tries: DEFAULT_PORT_TRIES,
            format: WireFormat::default(),
        }
    }
}

/// Single-connection-at-a-time key-value server.
///
/// The server owns the store outright. Connections are served one after
/// another on the accepting task, so the store never has more than one
/// reader or writer.
pub struct Server {
    listener: TcpListener,
    store: Store,
    format: WireFormat,
}

impl Server {
    pub fn new(listener: TcpListener, format: WireFormat) -> Self {
        Self {
            listener,
            store: Store::new(),
            format,
        }
    }

    /// Binds the first free port in the configured range and starts listening.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let socket = bind_first_free(config)?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .context("failed to listen on bound socket")?;
        Ok(Self::new(listener, config.format))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` completes, then hands back the store.
    ///
    /// A connection in progress is abandoned when `shutdown` fires.
    pub async fn run_until<F>(self, shutdown: F) -> Result<Store>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            mut store,
            format,
        } = self;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                        continue;
                    }
                },
            };

            info!(%peer, "client connected");
            select! {
                _ = &mut shutdown => break,
                result = serve_connection(stream, &mut store, format) => match result {
                    Ok(()) => info!(%peer, "client disconnected"),
                    Err(err) => error!(%peer, error = %err, "connection closed with error"),
                },
            }
        }

        info!("server shutting down");
        drop(listener);
        Ok(store)
    }

    /// Serves until SIGINT or SIGTERM.
    pub async fn run_until_signal(self) -> Result<Store> {
        let signal = shutdown_signal()?;
        self.run_until(signal).await
    }
}

fn bind_first_free(config: &ServerConfig) -> Result<TcpSocket> {
    let tries = config.port_tries.max(1);
    let ports = (0..tries).map_while(|offset| config.port.checked_add(offset));

    for port in ports {
        let addr = SocketAddr::new(config.host, port);
        info!(port, "trying port");
        match try_bind(addr) {
            Ok(socket) => {
                info!(%addr, "bound listening socket");
                return Ok(socket);
            }
            Err(err) => error!(%addr, error = %err, "bind failed"),
        }
    }

    anyhow::bail!(
        "no free port in {} starting at {} ({} tried)",
        config.host,
        config.port,
        tries
    )
}

fn try_bind(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(addr)?;
    Ok(socket)
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    Ok(async move {
        select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = ?err, "failed to listen for ctrl-c");
                }
            }
            _ = terminate.recv() => {}
        }
        info!("signal received, shutting down");
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    Ok(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to listen for ctrl-c");
        }
        info!("signal received, shutting down");
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Request(Vec<u8>),
    Oversized,
    Closed,
}

/// Runs the read, execute, reply cycle until the peer closes.
///
/// Rejected requests get their error reply and the connection stays open.
/// Only an oversized request closes it, because the rest of that request
/// cannot be told apart from the next one.
pub async fn serve_connection<S>(stream: S, store: &mut Store, format: WireFormat) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let (reply, keep_open) = match read_frame(&mut reader, format).await? {
            Frame::Closed => return Ok(()),
            Frame::Request(buf) => {
                debug!(request = %String::from_utf8_lossy(&buf).trim_end(), "received request");
                (protocol::handle(store, format, &buf), true)
            }
            Frame::Oversized => (protocol::reject(&RequestError::TooLarge), false),
        };

        writer.write_all(&reply.encode(format)).await?;
        writer.flush().await?;

        if !keep_open {
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Reads the next request buffer, skipping blank input.
///
/// Line requests end at `\n`; a JSON request is whatever one read returns.
/// Either way the buffer, terminator included, must fit in
/// [`MAX_REQUEST_LEN`] bytes.
async fn read_frame<R>(reader: &mut R, format: WireFormat) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_REQUEST_LEN + 1;
    loop {
        let mut buf = Vec::new();
        let read = match format {
            WireFormat::Line => {
                (&mut *reader)
                    .take(limit as u64)
                    .read_until(b'\n', &mut buf)
                    .await?
            }
            WireFormat::Json => {
                buf.resize(limit, 0);
                let read = reader.read(&mut buf).await?;
                buf.truncate(read);
                read
            }
        };

        if read == 0 {
            return Ok(Frame::Closed);
        }
        if buf.len() > MAX_REQUEST_LEN {
            return Ok(Frame::Oversized);
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Frame::Request(buf));
    }
}
