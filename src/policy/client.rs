use std::io;
use std::time::Duration as WallDuration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};

use super::{DecisionPolicy, Request};
use crate::config::{Framing, PolicyConfig};
use crate::utils::prelude::*;

/// Blocking client of the decision service over one persistent TCP connection.
///
/// Every request is retried up to `max_attempts` times. An attempt that times out or hits an I/O error
/// drops the connection, and the next attempt reconnects and sends the same line again.
pub struct DecisionClient {
    addr: String,
    framing: Framing,
    max_attempts: u32,
    attempt_timeout: WallDuration,
    runtime: Runtime,
    conn: Option<Connection>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn exchange(&mut self, line: &[u8], framing: Framing) -> io::Result<String> {
        self.writer.write_all(line).await?;
        self.writer.flush().await?;

        match framing {
            Framing::LengthPrefixed => {
                let len = self.reader.read_u16().await?;
                let mut buf = vec![0; usize::from(len)];
                self.reader.read_exact(&mut buf).await?;
                String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Framing::Line => {
                let mut resp = String::new();
                if self.reader.read_line(&mut resp).await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(resp.trim_end_matches(&['\r', '\n'][..]).to_owned())
            }
        }
    }
}

impl DecisionClient {
    /// Connect to the service, failing right away if it is unreachable
    pub fn connect(cfg: &PolicyConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let conn = runtime
            .block_on(Connection::open(&cfg.address))
            .map_err(|source| Error::Connect {
                addr: cfg.address.clone(),
                source,
            })?;
        info!(addr = %cfg.address, framing = %cfg.framing, "connected to decision service");

        Ok(Self {
            addr: cfg.address.clone(),
            framing: cfg.framing,
            max_attempts: cfg.max_attempts,
            attempt_timeout: WallDuration::from_millis(cfg.attempt_timeout_ms),
            runtime,
            conn: Some(conn),
        })
    }

    fn attempt(&mut self, line: &str) -> io::Result<String> {
        let Self {
            addr,
            framing,
            attempt_timeout,
            runtime,
            conn,
            ..
        } = self;
        let framing = *framing;

        runtime.block_on(async move {
            let exchange = async move {
                // taken out so a failed or cancelled attempt leaves no connection behind
                let mut open = match conn.take() {
                    Some(open) => open,
                    None => {
                        debug!(%addr, "reconnecting");
                        Connection::open(addr).await?
                    }
                };
                let resp = open.exchange(line.as_bytes(), framing).await?;
                *conn = Some(open);
                Ok(resp)
            };
            tokio::time::timeout(*attempt_timeout, exchange)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no response in time"))?
        })
    }
}

impl DecisionPolicy for DecisionClient {
    fn request(&mut self, req: &Request) -> Result<String> {
        let _s = debug_span!("request", action = req.name()).entered();
        let line = req.to_line()?;

        for attempt in 1..=self.max_attempts {
            match self.attempt(&line) {
                Ok(resp) => {
                    debug!(attempt, %resp, "response");
                    return Ok(resp);
                }
                Err(err) => {
                    warn!(attempt, max_attempts = self.max_attempts, %err, "request attempt failed");
                }
            }
        }

        error!(max_attempts = self.max_attempts, "the decision service never answered");
        Err(Error::RetriesExhausted {
            attempts: self.max_attempts,
        })
    }
}
