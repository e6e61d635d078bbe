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

//! Lets the application decide which recipients a connection accepts.
//!
//! Register a [`RecipientValidator`] with [`crate::Server::with_validator`]. Every `RCPT` then
//! waits for the validator to answer through its [`Responder`] before the client gets a reply.

use tokio::sync::oneshot;

/// The answer to a recipient validation.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Validation {
    /// Accept the recipient as this address, which may differ from the one the client sent.
    Accept(String),
    /// Reject the recipient, telling the client this reason.
    Reject(String),
}

/// Answers one validation request.
///
/// Consumed on use, so a request is answered at most once. Dropping it without answering
/// rejects the recipient.
#[derive(Debug)]
#[must_use = "the connection waits until the responder is used or dropped"]
pub struct Responder {
    sender: oneshot::Sender<Validation>,
}

impl Responder {
    /// Create a responder and the receiver that the waiting connection holds.
    pub(crate) fn new() -> (Self, oneshot::Receiver<Validation>) {
        let (sender, receiver) = oneshot::channel();

        (Self { sender }, receiver)
    }

    /// Send a [`Validation`].
    pub fn respond(self, validation: Validation) {
        // The connection may have gone away while the validator was working.
        if self.sender.send(validation).is_err() {
            tracing::debug!("recipient validation answered after the connection closed");
        }
    }

    /// Accept the recipient as `address`.
    pub fn accept(self, address: impl Into<String>) {
        self.respond(Validation::Accept(address.into()));
    }

    /// Reject the recipient with `reason`, which is sent to the client after a `553` code.
    pub fn reject(self, reason: impl Into<String>) {
        self.respond(Validation::Reject(reason.into()));
    }
}

/// Decides whether a recipient is accepted.
///
/// `validate` is called once per `RCPT` with a syntactically valid, non-empty address. It must
/// not block; it may answer right away or move the [`Responder`] into a task and answer later.
/// Only the connection that sent the `RCPT` waits for the answer.
pub trait RecipientValidator: Send + Sync + 'static {
    fn validate(&self, address: String, responder: Responder);
}

impl<F> RecipientValidator for F
where
    F: Fn(String, Responder) + Send + Sync + 'static,
{
    fn validate(&self, address: String, responder: Responder) {
        self(address, responder);
    }
}
