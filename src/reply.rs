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

//! Formats server replies.
//!
//! A reply is one or more lines of `<code><SP or '-'><text><CRLF>`. Every line but the last
//! uses `-` after the code ([RFC 5321 section
//! 4.2.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.2.1)).

use std::fmt::{Display, Write};

use crate::str::{ReplyText, CRLF};

/// A complete reply to one command.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Reply {
    code: u16,
    lines: Vec<ReplyText>,
}

impl Reply {
    /// A single-line reply.
    #[must_use]
    pub fn new(code: u16, text: impl Into<ReplyText>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// A multi-line reply. An empty iterator produces a single line with no text.
    #[must_use]
    pub fn multiline<I, T>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ReplyText>,
    {
        let mut lines: Vec<ReplyText> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            lines.push(ReplyText::default());
        }

        Self { code, lines }
    }

    /// `250 Ok`.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(250, "Ok")
    }

    /// `500 Error: bad syntax`.
    #[must_use]
    pub fn bad_syntax() -> Self {
        Self::new(500, "Error: bad syntax")
    }

    /// `501 Syntax: <verb>[ <usage>]`.
    #[must_use]
    pub fn syntax(verb: &str, usage: Option<&str>) -> Self {
        match usage {
            Some(usage) => Self::new(501, format!("Syntax: {verb} {usage}")),
            None => Self::new(501, format!("Syntax: {verb}")),
        }
    }

    /// `502 Error: command "<verb>" not implemented`.
    #[must_use]
    pub fn not_implemented(verb: &str) -> Self {
        Self::new(502, format!("Error: command \"{verb}\" not implemented"))
    }

    /// `503 <text>`, for commands issued out of order.
    #[must_use]
    pub fn bad_sequence(text: &str) -> Self {
        Self::new(503, text)
    }

    /// The reply code.
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// The text of every line, in order.
    #[must_use]
    pub fn lines(&self) -> &[ReplyText] {
        &self.lines
    }

    /// Intermediate replies (`3yz`) expect the client to keep sending before the command is done.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last = self.lines.len() - 1;

        for (index, line) in self.lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };

            write!(f, "{}", self.code)?;
            f.write_char(separator)?;
            write!(f, "{line}")?;
            f.write_str(CRLF)?;
        }

        Ok(())
    }
}
