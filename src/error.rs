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

//! Errors that end an SMTP session.
//!
//! Anything the client did wrong is answered with a reply and never becomes an [`Error`]. These
//! are only the failures that tear a connection down.

use std::io;

/// Result type alias for fallible session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures that terminate a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The TLS handshake after `STARTTLS` failed. The connection is abandoned.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The TLS handshake after `STARTTLS` did not finish within the configured bound.
    #[error("TLS handshake timed out")]
    HandshakeTimedOut,

    /// The secure-context provider could not supply a TLS configuration.
    #[error("secure context unavailable: {0}")]
    SecureContext(String),

    /// TLS credentials could not be loaded.
    #[error("invalid TLS credentials: {0}")]
    Credentials(#[from] rustls::Error),
}

impl Error {
    /// Returns true if the session was torn down by the TLS upgrade rather than by the transport.
    #[must_use]
    pub const fn is_security_fatal(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::HandshakeTimedOut | Self::SecureContext(_)
        )
    }
}
