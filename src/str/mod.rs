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

//! Text that is safe to put on the wire.

use std::fmt::Display;

use ascii::{AsciiChar, AsciiStr, AsciiString};


pub const CRLF: &str = "\r\n";

/// Text guaranteed to fit on a single SMTP reply line.
///
/// [RFC 5321](https://www.rfc-editor.org/rfc/rfc5321.html) requires that only US-ASCII character
/// encoding (sections 2.3.1 and 2.4) is used, and a reply line ends at the first `CRLF` (section
/// 4.2). Reply text can come from outside this crate (a recipient validator's rejection reason,
/// a client's greeting), so anything that could end the line early or smuggle in a second reply
/// is replaced.
///
/// Does not carry a trailing line ending sequence.
#[repr(transparent)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Clone, Default)]
pub struct ReplyText {
    str: AsciiString,
}

impl ReplyText {
    /// Creates a new [`Self`], replacing characters that cannot appear in a reply line.
    ///
    /// Replaces:
    /// - Any [`AsciiChar::CarriageReturn`], [`AsciiChar::LineFeed`], or other ASCII control
    ///   character with [`AsciiChar::Space`].
    /// - Any non-ASCII character with [`AsciiChar::Question`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use smtp_intake::str::ReplyText;
    /// let text = ReplyText::new("no such user\r\n250 Ok");
    ///
    /// assert_eq!(text.as_str(), "no such user  250 Ok");
    /// ```
    #[must_use]
    pub fn new(str: &str) -> Self {
        let str = str
            .chars()
            .map(|char| match AsciiChar::from_ascii(char) {
                Ok(char) if char.is_ascii_control() => AsciiChar::Space,
                Ok(char) => char,
                Err(_) => AsciiChar::Question,
            })
            .collect();

        Self { str }
    }

    /// Return a reference to the inner [`AsciiStr`].
    #[must_use]
    pub fn as_inner(&self) -> &AsciiStr {
        &self.str
    }

    /// Return the text as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.str.as_str()
    }
}

impl Display for ReplyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.str.fmt(f)
    }
}

impl From<&str> for ReplyText {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ReplyText {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}
