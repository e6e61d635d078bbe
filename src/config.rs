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

//! Server configuration.

use std::time::Duration;

/// How a [`crate::Server`] introduces itself and how long its connections wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The hostname announced in the greeting and in replies to `HELO`, `EHLO`, and `QUIT`.
    pub hostname: String,
    /// The product name announced in the greeting.
    pub name: String,
    /// The product version announced in the greeting.
    pub version: String,
    /// How long a connection waits for the next line from the client. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// How long `RCPT` waits for the recipient validator. `None` waits forever.
    pub validation_timeout: Option<Duration>,
    /// How long the TLS handshake after `STARTTLS` may take. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl Config {
    /// Creates a configuration announcing `hostname`, with no timeouts.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(hostname: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Self::new(hostname),
        }
    }

    /// The text of the `220` greeting: hostname, product name, and version.
    #[must_use]
    pub fn greeting(&self) -> String {
        format!("{} {} {}", self.hostname, self.name, self.version)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            idle_timeout: None,
            validation_timeout: None,
            handshake_timeout: None,
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the product name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the product version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Sets how long to wait for the next line from the client.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Sets how long `RCPT` waits for the recipient validator.
    #[must_use]
    pub const fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.validation_timeout = Some(timeout);
        self
    }

    /// Sets how long the TLS handshake may take.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}
