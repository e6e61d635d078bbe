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

//! Parses lines from an SMTP client into commands.
//!
//! See [`parse`] and [`parse_path`].

mod commands;

use std::{
    fmt::{Debug, Display},
    ops::Range,
};

use ascii::{AsAsciiStr, AsciiStr, AsciiString};

/// The shortest verb this server will recognize as a command.
const MIN_VERB_LEN: usize = 4;
/// The longest verb this server will recognize as a command.
const MAX_VERB_LEN: usize = 8;

/// Every command verb this server implements.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
}

impl Verb {
    pub const ALL: [Self; 9] = [
        Self::Helo,
        Self::Ehlo,
        Self::Mail,
        Self::Rcpt,
        Self::Data,
        Self::Rset,
        Self::Noop,
        Self::Quit,
        Self::StartTls,
    ];

    /// Look up an uppercase verb.
    #[must_use]
    pub fn from_verb(verb: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|known| known.as_str() == verb)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::StartTls => "STARTTLS",
        }
    }

    /// What this verb expects of its argument.
    #[must_use]
    pub const fn syntax(self) -> Syntax {
        match self {
            Self::Helo | Self::Ehlo => Syntax::Required("hostname"),
            Self::Mail => Syntax::Required("FROM:<address>"),
            Self::Rcpt => Syntax::Required("TO: <address>"),
            Self::Data | Self::Rset | Self::Noop => Syntax::Forbidden,
            Self::Quit | Self::StartTls => Syntax::Ignorable,
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a verb takes an argument.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Syntax {
    /// An argument must be present. Holds a description of it for `501` replies.
    Required(&'static str),
    /// An argument must not be present.
    Forbidden,
    /// Any argument is accepted and ignored.
    Ignorable,
}

impl Syntax {
    /// Whether a command with or without an argument fits this syntax.
    #[must_use]
    pub const fn permits(self, has_argument: bool) -> bool {
        match self {
            Self::Required(_) => has_argument,
            Self::Forbidden => !has_argument,
            Self::Ignorable => true,
        }
    }

    /// The description of the expected argument, if there is one.
    #[must_use]
    pub const fn usage(self) -> Option<&'static str> {
        match self {
            Self::Required(usage) => Some(usage),
            Self::Forbidden | Self::Ignorable => None,
        }
    }
}

/// Parse a line as a command.
///
/// A command is optional leading whitespace, a verb of four to eight letters, an optional single
/// space, and the argument. Trailing whitespace (including the line ending) is not part of the
/// argument, and an argument that is empty once it is gone counts as absent.
///
/// # Errors
///
/// [`CommandError`] if the line does not have that shape.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.as_ascii_str().map_err(|_| CommandError::NonAscii)?;

    // The index after the last byte that isn't whitespace.
    let end = line.trim_end().len();
    // The index of the first byte that isn't whitespace.
    let start = line.as_str()[..end]
        .find(|c: char| !c.is_ascii_whitespace())
        .unwrap_or(end);

    if start == end {
        return Err(CommandError::Empty);
    }

    let verb_len = line.as_str()[start..end]
        .bytes()
        .take(MAX_VERB_LEN)
        .take_while(u8::is_ascii_alphabetic)
        .count();

    if verb_len < MIN_VERB_LEN {
        return Err(CommandError::BadVerb);
    }

    let verb = start..start + verb_len;

    // At most one separating space belongs to the command, anything after it is argument text.
    let mut argument_start = verb.end;
    if line.as_str()[argument_start..end].starts_with(' ') {
        argument_start += 1;
    }

    let argument = argument_start..end;

    if line.as_str()[argument.clone()].contains(['\r', '\n']) {
        return Err(CommandError::LineBreak);
    }

    let mut line: AsciiString = line[..end].to_owned();

    // Make the command verb uppercase for standardized comparison.
    //
    // Note that the mailbox-local part of an email address (ex. `smith` in `smith@example.com`) is
    // the only case-sensitive part of an SMTP command, so the argument is not set to uppercase.
    line[verb.clone()].make_ascii_uppercase();

    Ok(Command {
        line,
        verb,
        argument: if argument.is_empty() {
            None
        } else {
            Some(argument)
        },
    })
}

/// One line of an SMTP command.
#[derive(PartialEq, Eq, Clone)]
pub struct Command {
    /// The line without trailing whitespace, unmodified except for the [`Self::verb`] range being
    /// set to uppercase.
    line: AsciiString,
    /// The range over [`Self::line`] containing the verb of the command.
    verb: Range<usize>,
    /// The range over [`Self::line`] containing the argument of the command, if it is not empty.
    argument: Option<Range<usize>>,
}

impl Command {
    /// Get the line without trailing whitespace.
    #[must_use]
    pub fn line(&self) -> &AsciiStr {
        self.line.as_ref()
    }

    /// Get the verb of the command as an uppercase string slice.
    #[must_use]
    pub fn verb(&self) -> &str {
        self.line[self.verb.clone()].as_str()
    }

    /// Get the argument of the command as a string slice.
    #[must_use]
    pub fn argument(&self) -> Option<&str> {
        let range = self.argument.clone()?;

        Some(self.line[range].as_str())
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("line", &self.line)
            .field("verb()", &self.verb())
            .field("argument()", &self.argument())
            .finish()
    }
}

/// Possible error states encountered when trying to convert a line into a [`Command`].
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum CommandError {
    /// The line is empty or consists only of whitespace.
    Empty,
    /// The line does not start with a verb of four to eight letters.
    BadVerb,
    /// The line contains a carriage return before its end.
    LineBreak,
    /// The line contains characters outside of US-ASCII.
    NonAscii,
}

impl Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty command",
            Self::BadVerb => "command does not start with a verb",
            Self::LineBreak => "command contains a line break",
            Self::NonAscii => "command contains non-ASCII characters",
        })
    }
}

impl std::error::Error for CommandError {}

/// The keyword that introduces a path in a `MAIL` or `RCPT` argument.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum PathKeyword {
    /// `FROM:`, for the reverse-path of `MAIL`.
    From,
    /// `TO:`, for the forward-path of `RCPT`.
    To,
}

impl PathKeyword {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::From => "FROM:",
            Self::To => "TO:",
        }
    }
}

/// Extract the address from a `FROM:<address>` or `TO:<address>` argument.
///
/// The keyword is case-insensitive and may be surrounded by whitespace. The angle brackets are
/// optional and a missing closing bracket is tolerated, but nothing except whitespace may follow
/// one. The address is trimmed of surrounding whitespace.
///
/// Returns `None` if the argument is not in that shape. `<>` gives `Some("")`, which is a valid
/// (null) path and is not the same as `None`. An unbracketed path must not be empty.
#[must_use]
pub fn parse_path(argument: &str, keyword: PathKeyword) -> Option<String> {
    let argument = argument.trim_start();
    let prefix = keyword.as_str();

    if !argument.get(..prefix.len())?.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let rest = argument[prefix.len()..].trim_start();

    let (path, after) = match rest.strip_prefix('<') {
        Some(bracketed) => bracketed.split_once('>').unwrap_or((bracketed, "")),
        None => {
            let (path, after) = rest.split_once('>').unwrap_or((rest, ""));
            let path = path.trim();

            if path.is_empty() || path.contains(char::is_whitespace) {
                return None;
            }

            (path, after)
        }
    };

    if !after.trim().is_empty() {
        return None;
    }

    Some(path.trim().to_string())
}
