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

//! The state of one mail transaction.

/// Sender, recipients, and body of the mail transaction in progress on a connection.
///
/// Upholds:
/// - `recipients` is only non-empty while `sender` is set.
/// - `sender` is set exactly once between resets.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct Envelope {
    /// `None` until `MAIL`. `Some("")` is the null reverse-path used by bounces.
    sender: Option<String>,
    recipients: Vec<String>,
    body: Vec<String>,
}

/// The envelope was asked to do something its current state does not allow.
#[derive(PartialEq, Eq, Debug, Copy, Clone, thiserror::Error)]
pub enum EnvelopeError {
    /// `MAIL` was issued while a transaction was already open.
    #[error("a sender is already set")]
    SenderAlreadySet,
    /// `RCPT` was issued before `MAIL`.
    #[error("no sender is set")]
    NoSender,
}

impl Envelope {
    /// Clear the sender, recipients, and body.
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.body.clear();
    }

    /// Open a transaction with `sender` as the reverse-path.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::SenderAlreadySet`] if a transaction is already open.
    pub fn begin_transaction(&mut self, sender: String) -> Result<(), EnvelopeError> {
        if self.sender.is_some() {
            return Err(EnvelopeError::SenderAlreadySet);
        }

        self.sender = Some(sender);
        Ok(())
    }

    /// Append an accepted recipient.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::NoSender`] if no transaction is open.
    pub fn add_recipient(&mut self, recipient: String) -> Result<(), EnvelopeError> {
        if self.sender.is_none() {
            return Err(EnvelopeError::NoSender);
        }

        self.recipients.push(recipient);
        Ok(())
    }

    /// Append a line of message content, with transparency already removed.
    pub fn push_line(&mut self, line: String) {
        self.body.push(line);
    }

    /// The reverse-path from `MAIL`, or `None` outside a transaction. The null path is `Some("")`.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The accepted forward-paths, in the order they were accepted.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// The content lines collected so far.
    pub fn body(&self) -> &[String] {
        &self.body
    }

    /// Whether `MAIL` has been accepted and the transaction not yet finished or reset.
    pub const fn in_transaction(&self) -> bool {
        self.sender.is_some()
    }

    /// Take the finished transaction out, leaving `self` reset.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Split into `(sender, recipients, body)`. An unset sender becomes the null reverse-path.
    pub fn into_parts(self) -> (String, Vec<String>, Vec<String>) {
        (self.sender.unwrap_or_default(), self.recipients, self.body)
    }
}
