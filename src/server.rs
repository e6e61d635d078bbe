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

//! Accepts streams, runs a [`Connection`] on each, and collects the messages they receive.
//!
//! See [`Server`].

use std::{
    fmt::Debug,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use futures_core::Stream;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    config::Config,
    connection::{CloseReason, Connection, ConnectionId},
    error::Result,
    tls::SecureContextProvider,
    validate::RecipientValidator,
};

/// A message received by a connection, with its envelope.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Message {
    /// The connection the message arrived on.
    pub connection: ConnectionId,
    /// The client that sent the message.
    pub remote_address: SocketAddr,
    /// The reverse-path from `MAIL`. Empty for the null sender.
    pub sender: String,
    /// The accepted forward-paths from `RCPT`, in the order they were accepted.
    pub recipients: Vec<String>,
    /// The content lines, with transparency removed and without line endings.
    pub body: Vec<String>,
    /// Whether the message was received after a `STARTTLS` upgrade.
    pub secure: bool,
}

impl Message {
    /// The content as one string, with `CRLF` line endings.
    #[must_use]
    pub fn data(&self) -> String {
        self.body.join(crate::str::CRLF)
    }
}

/// Aggregate counts across every connection of a [`Server`].
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub struct Stats {
    /// Messages handed to [`Incoming`].
    pub messages_total: u64,
    /// Connections currently open.
    pub connections_current: u64,
    /// The most connections that were ever open at once.
    pub connections_max: u64,
    /// Connections ever opened.
    pub connections_total: u64,
}

/// The stream of messages received by every connection of a [`Server`].
///
/// Once this is dropped, connections refuse messages at the end of `DATA` instead of accepting
/// them.
#[derive(Debug)]
pub struct Incoming {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Incoming {
    /// Wait for the next message.
    ///
    /// Returns `None` once every handle to the [`Server`] is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Stream for Incoming {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// The message intake was closed.
#[derive(Debug)]
pub(crate) struct IntakeClosed;

/// Runs SMTP sessions and collects what they receive.
///
/// Cheap to clone; every clone shares the same configuration, hooks, statistics, and
/// [`Incoming`].
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    validator: Option<Arc<dyn RecipientValidator>>,
    secure_context: Option<Arc<dyn SecureContextProvider>>,
    stats: Arc<Mutex<Stats>>,
    messages: mpsc::UnboundedSender<Message>,
}

impl Server {
    /// Create a server and the stream its received messages arrive on.
    #[must_use]
    pub fn new(config: Config) -> (Self, Incoming) {
        let (messages, receiver) = mpsc::unbounded_channel();

        let server = Self {
            config: Arc::new(config),
            validator: None,
            secure_context: None,
            stats: Arc::default(),
            messages,
        };

        (server, Incoming { receiver })
    }

    /// Ask `validator` about every recipient before accepting it.
    #[must_use]
    pub fn with_validator(mut self, validator: impl RecipientValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Offer `STARTTLS`, upgrading with the configuration `provider` supplies.
    #[must_use]
    pub fn with_secure_context(mut self, provider: impl SecureContextProvider) -> Self {
        self.secure_context = Some(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn validator(&self) -> Option<&Arc<dyn RecipientValidator>> {
        self.validator.as_ref()
    }

    pub(crate) fn secure_context(&self) -> Option<&Arc<dyn SecureContextProvider>> {
        self.secure_context.as_ref()
    }

    /// A snapshot of the aggregate counts.
    #[must_use]
    pub fn stats(&self) -> Stats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the aggregate counts.
    pub fn log_stats(&self) {
        let stats = self.stats();

        info!(
            messages = stats.messages_total,
            connections.current = stats.connections_current,
            connections.max = stats.connections_max,
            connections.total = stats.connections_total,
            "server statistics"
        );
    }

    /// Accept connections from `listener` forever, running each session on its own task.
    ///
    /// Yields the handle of every spawned session, or the error from a failed accept. Nothing is
    /// accepted until the stream is polled.
    pub fn listen(
        &self,
        listener: TcpListener,
    ) -> impl Stream<Item = io::Result<JoinHandle<Result<CloseReason>>>> {
        let server = self.clone();

        async_stream::stream! {
            if let Ok(address) = listener.local_addr() {
                info!(%address, hostname = %server.config.hostname, "SMTP server listening");
            }

            loop {
                let accepted = listener.accept().await;

                yield accepted.map(|(stream, peer)| server.spawn(stream, peer));
            }
        }
    }

    /// Run a session over `stream` on a new task.
    pub fn spawn<S>(&self, stream: S, peer: SocketAddr) -> JoinHandle<Result<CloseReason>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.clone().serve(stream, peer))
    }

    /// Run a session over `stream` until it ends.
    ///
    /// The session counts as open for as long as this future exists, so dropping or aborting it
    /// closes the session.
    ///
    /// # Errors
    ///
    /// See [`Connection::run`].
    pub async fn serve<S>(self, stream: S, peer: SocketAddr) -> Result<CloseReason>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = ConnectionId::next();
        let span = info_span!("connection", id = %id, %peer);

        let _registration = self.register(id);

        let outcome = Connection::new(id, stream, peer, self)
            .run()
            .instrument(span.clone())
            .await;

        if let Err(error) = &outcome {
            span.in_scope(|| warn!(%error, "connection aborted"));
        }

        outcome
    }

    /// Count a new connection. It is counted as closed when the returned guard is dropped.
    fn register(&self, id: ConnectionId) -> Registration {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        stats.connections_current += 1;
        stats.connections_total += 1;
        stats.connections_max = stats.connections_max.max(stats.connections_current);

        Registration {
            id,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Take a finished message from a connection.
    pub(crate) fn incoming(&self, message: Message) -> std::result::Result<(), IntakeClosed> {
        info!(
            sender = %message.sender,
            recipients = message.recipients.len(),
            lines = message.body.len(),
            "message received"
        );

        self.messages.send(message).map_err(|_| IntakeClosed)?;

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages_total += 1;

        Ok(())
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("validator", &self.validator.is_some())
            .field("secure_context", &self.secure_context.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Keeps a connection counted as open until dropped.
struct Registration {
    id: ConnectionId,
    stats: Arc<Mutex<Stats>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.connections_current = stats.connections_current.saturating_sub(1);

        tracing::debug!(id = %self.id, "connection unregistered");
    }
}
