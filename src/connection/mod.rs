// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! Runs one SMTP session over an accepted stream.
//!
//! See [`Connection::run`].

mod command;
mod envelope;
mod transport;

use std::{
    fmt::Display,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rustls::ServerConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    time::error::Elapsed,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub use command::{parse, parse_path, Command, CommandError, PathKeyword, Syntax, Verb};
pub use envelope::{Envelope, EnvelopeError};
use transport::Transport;

use crate::{
    error::{Error, Result},
    reply::Reply,
    server::{Message, Server},
};

/// A process-unique identifier for a connection.
///
/// Stays the same across a `STARTTLS` upgrade.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Copy, Clone)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value, as it appears in logs.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// How incoming lines are interpreted.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
enum Mode {
    /// Every line is a command.
    Command,
    /// Every line is message content, until a line holding only `.`.
    Data,
}

/// What the session loop should do after a line has been handled.
#[derive(Debug)]
enum Flow {
    /// Read the next line.
    Keep,
    /// The `220` reply to `STARTTLS` has been sent; perform the handshake with this
    /// configuration before reading anything else.
    StartTls(Arc<ServerConfig>),
    /// End the session because of [`CloseReason`].
    Close(CloseReason),
}

/// Indicates why a session ended without an error.
#[derive(PartialEq, Eq, Debug)]
pub enum CloseReason {
    /// The SMTP client requested to quit the session.
    Quit,
    /// More time [`Elapsed`] than [`crate::Config::idle_timeout`] specifies.
    TimedOut(Elapsed),
    /// The stream was closed or forcefully ended by the client.
    ClosedByClient,
}

/// One SMTP session.
///
/// Owns exactly one transport at a time. Lines are handled strictly one after another: nothing
/// more is read until the reply to the current line has been written.
pub struct Connection<S> {
    id: ConnectionId,
    peer: SocketAddr,
    server: Server,
    /// The client's `HELO`/`EHLO` argument. Cleared by a `STARTTLS` upgrade.
    greeted: Option<String>,
    mode: Mode,
    envelope: Envelope,
    transport: Transport<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(id: ConnectionId, stream: S, peer: SocketAddr, server: Server) -> Self {
        Self {
            id,
            peer,
            server,
            greeted: None,
            mode: Mode::Command,
            envelope: Envelope::default(),
            transport: Transport::Plain(BufReader::new(stream)),
        }
    }

    /// Greet the client, then handle lines until the session ends.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the transport fails.
    /// - [`Error::Handshake`] or [`Error::HandshakeTimedOut`] if a `STARTTLS` upgrade does not
    ///   complete. No further replies are sent in that case.
    pub async fn run(mut self) -> Result<CloseReason> {
        /// Read a line out of the transport or break with [`CloseReason`].
        ///
        /// Implicitly calls `.await`.
        ///
        /// # Breaks
        ///
        /// If the client closes or resets the stream, `break` with
        /// [`CloseReason::ClosedByClient`]. If the read takes longer than
        /// [`crate::Config::idle_timeout`], reply `421` and break with [`CloseReason::TimedOut`].
        ///
        /// # Errors
        ///
        /// - Any other errors that could come out of the transport's `read_line` function.
        macro_rules! read_line_or_break {
            ($connection:ident, $buffer:expr) => {{
                let idle_timeout = $connection.server.config().idle_timeout;
                let read = $connection.transport.read_line($buffer);
                let result = match idle_timeout {
                    Some(limit) => match ::tokio::time::timeout(limit, read).await {
                        Ok(result) => result,
                        Err(elapsed) => {
                            let text = format!(
                                "{} Error: timeout exceeded",
                                $connection.server.config().hostname
                            );
                            // The client may already be gone.
                            let _ = $connection.reply(Reply::new(421, text)).await;
                            break CloseReason::TimedOut(elapsed);
                        }
                    },
                    None => read.await,
                };

                match result {
                    Ok(0) => break CloseReason::ClosedByClient,
                    Ok(read) => read,
                    Err(err) => match err.kind() {
                        ::std::io::ErrorKind::ConnectionAborted
                        | ::std::io::ErrorKind::ConnectionReset
                        | ::std::io::ErrorKind::UnexpectedEof => {
                            break CloseReason::ClosedByClient
                        }
                        _ => return Err(err.into()),
                    },
                }
            }};
        }

        info!("connection opened");

        let greeting = self.server.config().greeting();
        self.reply(Reply::new(220, greeting)).await?;

        let mut line = Vec::new();

        let close_reason = loop {
            line.clear();
            read_line_or_break!(self, &mut line);

            let flow = match self.mode {
                Mode::Command => {
                    let text = String::from_utf8_lossy(&line);
                    debug!(">> {}", text.trim_end());

                    self.dispatch(&text).await?
                }
                Mode::Data => self.collect(&line).await?,
            };

            match flow {
                Flow::Keep => (),
                Flow::StartTls(config) => self = self.start_tls(config).await?,
                Flow::Close(reason) => break reason,
            }
        };

        if close_reason == CloseReason::Quit {
            if let Err(error) = self.transport.shutdown().await {
                debug!(%error, "shutdown after QUIT failed");
            }
        }

        info!(reason = ?close_reason, "connection closed");
        Ok(close_reason)
    }

    /// Write a reply to the client.
    async fn reply(&mut self, reply: Reply) -> std::io::Result<()> {
        debug!("<< {}", reply.to_string().trim_end());

        self.transport.write_reply(&reply).await
    }

    /// Handle a line of message content.
    async fn collect(&mut self, line: &[u8]) -> Result<Flow> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line == b"." {
            return self.finish_message().await;
        }

        // Remove transparency per RFC 5321 section 4.5.2.
        //
        // https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.2
        let line = line.strip_prefix(b".").unwrap_or(line);
        self.envelope
            .push_line(String::from_utf8_lossy(line).into_owned());

        Ok(Flow::Keep)
    }

    /// Hand the finished message to the server and start over with an empty envelope.
    async fn finish_message(&mut self) -> Result<Flow> {
        let (sender, recipients, body) = self.envelope.take().into_parts();
        self.mode = Mode::Command;

        let message = Message {
            connection: self.id,
            remote_address: self.peer,
            sender,
            recipients,
            body,
            secure: self.transport.is_secure(),
        };

        let reply = match self.server.incoming(message) {
            Ok(()) => Reply::ok(),
            Err(_) => {
                warn!("message intake is closed, message refused");
                Reply::new(451, "Requested action aborted: local error in processing")
            }
        };

        self.reply(reply).await?;
        Ok(Flow::Keep)
    }

    /// Replace the plaintext transport with a TLS session over the same stream.
    ///
    /// Anything the client sent after `STARTTLS` and before the handshake is thrown away
    /// unread. Commands must only ever be read from the secure transport from here on.
    async fn start_tls(mut self, config: Arc<ServerConfig>) -> Result<Self> {
        let reader = match self.transport {
            Transport::Plain(reader) => reader,
            secure @ Transport::Secure(_) => {
                warn!("TLS upgrade requested on a secure transport");
                self.transport = secure;
                return Ok(self);
            }
        };

        let discarded = reader.buffer().len();
        if discarded > 0 {
            warn!(discarded, "discarding plaintext sent before the TLS handshake");
        }

        let handshake_timeout = self.server.config().handshake_timeout;
        let accept = TlsAcceptor::from(config).accept(reader.into_inner());
        let handshake = match handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, accept)
                .await
                .map_err(|_| Error::HandshakeTimedOut)?,
            None => accept.await,
        };
        let stream = handshake.map_err(Error::Handshake)?;

        info!("TLS session established");

        self.transport = Transport::Secure(Box::new(BufReader::new(stream)));
        self.greeted = None;
        self.envelope.reset();

        Ok(self)
    }
}

#[cfg(test)]
mod test {
    use super::ConnectionId;

    #[test]
    fn test_connection_ids() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();

        assert!(second.as_u64() > first.as_u64());
        assert_eq!(first.to_string(), first.as_u64().to_string());
    }
}
