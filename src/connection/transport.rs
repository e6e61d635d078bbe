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

//! The byte stream a connection reads commands from and writes replies to.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::server::TlsStream;

use crate::reply::Reply;

/// Plaintext until a `STARTTLS` upgrade succeeds, then TLS for the rest of the session.
pub(super) enum Transport<S> {
    /// The stream as it was accepted.
    Plain(BufReader<S>),
    /// A TLS session over the accepted stream.
    Secure(Box<BufReader<TlsStream<S>>>),
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read up to and including the next `LF` into `buffer`.
    ///
    /// Returns the number of bytes read, which is zero once the client has closed the stream.
    pub async fn read_line(&mut self, buffer: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Self::Plain(reader) => reader.read_until(b'\n', buffer).await,
            Self::Secure(reader) => reader.read_until(b'\n', buffer).await,
        }
    }

    /// Wait until the client closes the stream.
    ///
    /// Nothing is consumed. If the client sends more bytes instead, they stay buffered for the
    /// next [`Self::read_line`] and this never completes.
    ///
    /// # Errors
    ///
    /// Any error from reading the stream other than a reset or abort, which count as a close.
    pub async fn closed(&mut self) -> io::Result<()> {
        let filled = match self {
            Self::Plain(reader) => reader.fill_buf().await.map(|buffer| buffer.is_empty()),
            Self::Secure(reader) => reader.fill_buf().await.map(|buffer| buffer.is_empty()),
        };

        match filled {
            Ok(true) => Ok(()),
            Ok(false) => std::future::pending().await,
            Err(error) => match error.kind() {
                io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::UnexpectedEof => Ok(()),
                _ => Err(error),
            },
        }
    }

    /// Write every line of `reply` and flush it.
    pub async fn write_reply(&mut self, reply: &Reply) -> io::Result<()> {
        let bytes = reply.to_string();

        match self {
            Self::Plain(reader) => {
                reader.get_mut().write_all(bytes.as_bytes()).await?;
                reader.get_mut().flush().await
            }
            Self::Secure(reader) => {
                reader.get_mut().write_all(bytes.as_bytes()).await?;
                reader.get_mut().flush().await
            }
        }
    }

    /// Close the write side, sending a TLS `close_notify` first when secure.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(reader) => reader.get_mut().shutdown().await,
            Self::Secure(reader) => reader.get_mut().shutdown().await,
        }
    }

    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Secure(_))
    }
}
