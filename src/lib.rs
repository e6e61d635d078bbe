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

//! The connection-level engine of an SMTP submission server.
//!
//! A [`Server`] runs one session per accepted stream: it greets the client, parses commands,
//! keeps the envelope of the mail transaction in progress, upgrades the stream with `STARTTLS`,
//! and hands every completed message to [`Incoming`].
//!
//! ```rust,no_run
//! # use futures_util::{pin_mut, StreamExt};
//! # use smtp_intake::{Config, Server};
//! # use tokio::net::TcpListener;
//! #
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (server, mut incoming) = Server::new(Config::new("mx.example.com"));
//!
//! let sessions = server.listen(TcpListener::bind("127.0.0.1:2525").await?);
//! tokio::spawn(async move {
//!     pin_mut!(sessions);
//!     while let Some(Ok(_session)) = sessions.next().await {}
//! });
//!
//! while let Some(message) = incoming.recv().await {
//!     println!("{} -> {:?}", message.sender, message.recipients);
//! }
//! #     Ok(())
//! # }
//! ```

#![warn(clippy::nursery, clippy::pedantic)]
#![cfg_attr(debug_assertions, allow(clippy::missing_errors_doc))]

mod config;
mod connection;
mod error;
pub mod reply;
mod server;
pub mod str;
pub mod timeouts;
pub mod tls;
mod validate;

#[cfg(test)]
mod test;

pub use config::{Config, ConfigBuilder};
pub use connection::{
    parse, parse_path, CloseReason, Command, CommandError, Connection, ConnectionId,
    Envelope, EnvelopeError, PathKeyword, Syntax, Verb,
};
pub use error::{Error, Result};
pub use server::{Incoming, Message, Server, Stats};
pub use tls::SecureContextProvider;
pub use validate::{RecipientValidator, Responder, Validation};

/// Read a line, including its line ending, from an [`tokio::io::AsyncBufRead`].
///
/// Evaluates to a future of [`std::io::Result<String>`]. The string is empty at the end of the
/// stream.
#[macro_export]
macro_rules! read_line {
    ($reader:expr) => {
        async {
            let mut line = ::std::string::String::new();

            ::tokio::io::AsyncBufReadExt::read_line(&mut $reader, &mut line)
                .await
                .map(|_| line)
        }
    };
}

/// Write a string literal and a trailing `CRLF` to an [`tokio::io::AsyncWrite`].
///
/// Implicitly calls `.await`.
///
/// # Errors
///
/// Any errors that could come out of the supplied writer's `write_all` function.
#[macro_export]
macro_rules! write_line {
    ($writer:expr, $str:literal) => {
        ::tokio::io::AsyncWriteExt::write_all(&mut $writer, concat!($str, "\r\n").as_bytes()).await
    };
}

/// Format a line, append a trailing `CRLF`, and write it to an [`tokio::io::AsyncWrite`].
///
/// Implicitly calls `.await`.
///
/// # Errors
///
/// Any errors that could come out of the supplied writer's `write_all` function.
#[macro_export]
macro_rules! write_fmt_line {
    ($writer:expr, $($arg:tt)*) => {
        ::tokio::io::AsyncWriteExt::write_all(
            &mut $writer,
            format!("{}\r\n", format_args!($($arg)*)).as_bytes(),
        )
        .await
    };
}
