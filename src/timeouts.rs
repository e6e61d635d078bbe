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

//! Recommended bounds on how long a server waits during an SMTP session.
//!
//! Some amount of delays from transmission and processing are expected in an SMTP session. To
//! differentiate between these and a genuinely stalled session, [RFC 5321
//! 4.5.3.2](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.2) defines a list of
//! timeouts in minutes.
//!
//! [`crate::Config`] applies none of these by default: a connection waits as long as it takes
//! for the client, the recipient validator, and the TLS handshake. These are the values to reach
//! for when a deployment wants bounds.
//!
//! Note that, when testing, all timeouts are overridden to [`EXPECTED`]; because a testing
//! environment can be expected to have better performance than the real world.

/// A very strict timeout for how long participants should wait for anything.
///
/// Not specified by RFC 5321. This is for identifying unusual performance for testing and logging.
pub const EXPECTED: std::time::Duration = std::time::Duration::from_secs(3);

/// Generate `const` items with [`std::time::Duration`] values in minutes, optionally including
/// documentation comments.
///
/// Does not account for leap seconds or similar shenanigans. A "minute" is 60 of whatever
/// [`std::time::Duration`] considers to be a "second."
macro_rules! minute_durations {
        [$(
            $( #[$attr:meta] )*
            $label:ident = $minutes:expr
        ),+ ,] => {
            $(
                $( #[$attr] )*
                #[cfg(not(test))]
                pub const $label: ::std::time::Duration =
                    ::std::time::Duration::from_secs($minutes * 60);

                // For stricter performance checks during testing.
                $( #[$attr] )*
                #[cfg(test)]
                pub const $label: ::std::time::Duration =
                    $crate::timeouts::EXPECTED;
            )+
        };
    }

minute_durations![
    /// The minimum length in minutes a server should wait for the next command from a client.
    ///
    /// Suitable for [`crate::Config::idle_timeout`].
    ///
    /// [RFC 5321 § 4.5.3.2.7](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.2.7).
    SERVER_TIMEOUT = 5,
    /// The minimum length in minutes a client should wait for a reply after sending the `RCPT`
    /// command. A recipient validator that takes longer than this is answering a client that has
    /// probably given up.
    ///
    /// Suitable for [`crate::Config::validation_timeout`].
    ///
    /// [RFC 5321 § 4.5.3.2.3](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.2.3).
    RCPT = 5,
    /// How long to wait for a client to finish the TLS handshake after the `220` reply to
    /// `STARTTLS`.
    ///
    /// Not specified by RFC 5321 or RFC 3207. Suitable for [`crate::Config::handshake_timeout`].
    TLS_HANDSHAKE = 1,
];
