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

//! Supplies the TLS configuration that `STARTTLS` upgrades a connection with.
//!
//! The core never loads certificates itself. Whatever owns the credentials implements
//! [`SecureContextProvider`], or hands over a finished [`ServerConfig`] (which implements it).
//! A provider that serves several names installs a [`rustls::server::ResolvesServerCert`] on the
//! config it returns, which chooses a certificate from the client's server name indication.

use std::sync::Arc;

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};

use crate::error::Result;

/// Supplies the secure context for each TLS upgrade.
pub trait SecureContextProvider: Send + Sync + 'static {
    /// The configuration for the next handshake.
    ///
    /// # Errors
    ///
    /// [`crate::Error::SecureContext`] if no configuration can be supplied. The client that asked
    /// for `STARTTLS` gets a `454` reply and stays on the plaintext transport.
    fn secure_context(&self) -> Result<Arc<ServerConfig>>;
}

impl SecureContextProvider for Arc<ServerConfig> {
    fn secure_context(&self) -> Result<Arc<ServerConfig>> {
        Ok(Arc::clone(self))
    }
}

/// Build a server configuration for a single certificate chain, without client authentication.
///
/// # Errors
///
/// [`crate::Error::Credentials`] if the key does not fit the certificate or is not supported.
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    Ok(Arc::new(config))
}
