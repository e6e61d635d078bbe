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

//! Handles responding to particular commands from SMTP clients.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{
    super::{CloseReason, Connection, EnvelopeError, Flow, Mode},
    parse, parse_path, PathKeyword, Verb,
};
use crate::{error::Result, reply::Reply, validate::Responder, Validation};

/// How waiting for a recipient validation ended.
enum Verdict {
    Answered(Validation),
    /// [`crate::Config::validation_timeout`] elapsed first.
    TimedOut,
    /// The client closed the stream first.
    ClientClosed,
}

/// The reply for a command the envelope refused because of the order it came in.
fn sequence_reply(error: EnvelopeError) -> Reply {
    match error {
        EnvelopeError::SenderAlreadySet => Reply::bad_sequence("Error: nested MAIL command"),
        EnvelopeError::NoSender => Reply::bad_sequence("Error: need MAIL command"),
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reply to a line from the client while in command mode.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Io`] from writing the reply.
    pub(in crate::connection) async fn dispatch(&mut self, line: &str) -> Result<Flow> {
        let command = match parse(line) {
            Ok(command) => command,
            Err(error) => {
                debug!(%error, "unparsable command");
                return self.respond(Reply::bad_syntax()).await;
            }
        };

        let Some(verb) = Verb::from_verb(command.verb()) else {
            return self.respond(Reply::not_implemented(command.verb())).await;
        };

        let syntax = verb.syntax();
        let argument = command.argument();

        if !syntax.permits(argument.is_some()) {
            return self
                .respond(Reply::syntax(verb.as_str(), syntax.usage()))
                .await;
        }

        let argument = argument.unwrap_or_default();

        match verb {
            Verb::Helo => self.hello(argument).await,
            Verb::Ehlo => self.extended_hello(argument).await,
            Verb::Mail => self.mail(argument).await,
            Verb::Rcpt => self.recipient(argument).await,
            Verb::Data => self.data().await,
            Verb::Rset => self.reset().await,
            Verb::Noop => self.respond(Reply::ok()).await,
            Verb::Quit => self.quit().await,
            Verb::StartTls => self.start_tls_command().await,
        }
    }

    /// Write `reply` and keep the session going.
    async fn respond(&mut self, reply: Reply) -> Result<Flow> {
        self.reply(reply).await?;

        Ok(Flow::Keep)
    }

    /// Record the client's greeting, or refuse a second one.
    fn greet(&mut self, greeting: &str) -> Option<Reply> {
        if self.greeted.is_some() {
            return Some(Reply::bad_sequence("Duplicate HELO/EHLO"));
        }

        self.greeted = Some(greeting.to_string());
        None
    }

    fn hello_text(&self) -> String {
        format!(
            "{} Hello {}",
            self.server.config().hostname,
            self.peer.ip()
        )
    }

    /// Whether `STARTTLS` is advertised. It is until the transport is secure, even without a
    /// secure-context provider, in which case the command itself is answered with `454`.
    const fn offers_start_tls(&self) -> bool {
        !self.transport.is_secure()
    }

    /// Reply to the hello (`HELO`) command from a client.
    ///
    /// [RFC 5321 section 4.1.1.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.1).
    async fn hello(&mut self, greeting: &str) -> Result<Flow> {
        if let Some(refusal) = self.greet(greeting) {
            return self.respond(refusal).await;
        }

        let text = self.hello_text();
        self.respond(Reply::new(250, text)).await
    }

    /// Reply to the extended hello (`EHLO`) command from a client, listing the supported
    /// extensions.
    ///
    /// [RFC 5321 section 4.1.1.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.1).
    async fn extended_hello(&mut self, greeting: &str) -> Result<Flow> {
        if let Some(refusal) = self.greet(greeting) {
            return self.respond(refusal).await;
        }

        let mut lines = vec![self.hello_text()];
        if self.offers_start_tls() {
            lines.push(Verb::StartTls.to_string());
        }

        self.respond(Reply::multiline(250, lines)).await
    }

    /// Reply to the mail (`MAIL`) command from a client, opening a transaction.
    ///
    /// [RFC 5321 section 4.1.1.2](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.2).
    async fn mail(&mut self, argument: &str) -> Result<Flow> {
        if self.envelope.in_transaction() {
            return self
                .respond(sequence_reply(EnvelopeError::SenderAlreadySet))
                .await;
        }

        // An empty reverse-path (`<>`) is fine here.
        let Some(sender) = parse_path(argument, PathKeyword::From) else {
            return self
                .respond(Reply::syntax(Verb::Mail.as_str(), Verb::Mail.syntax().usage()))
                .await;
        };

        let reply = match self.envelope.begin_transaction(sender) {
            Ok(()) => Reply::ok(),
            Err(error) => sequence_reply(error),
        };

        self.respond(reply).await
    }

    /// Reply to the recipient (`RCPT`) command from a client, after asking the recipient
    /// validator if there is one.
    ///
    /// [RFC 5321 section 4.1.1.3](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.3).
    async fn recipient(&mut self, argument: &str) -> Result<Flow> {
        if !self.envelope.in_transaction() {
            return self.respond(sequence_reply(EnvelopeError::NoSender)).await;
        }

        let recipient = parse_path(argument, PathKeyword::To).filter(|path| !path.is_empty());
        let Some(recipient) = recipient else {
            return self
                .respond(Reply::syntax(Verb::Rcpt.as_str(), Verb::Rcpt.syntax().usage()))
                .await;
        };

        let reply = match self.validate(recipient).await? {
            Verdict::Answered(Validation::Accept(recipient)) => {
                match self.envelope.add_recipient(recipient) {
                    Ok(()) => Reply::ok(),
                    Err(error) => sequence_reply(error),
                }
            }
            Verdict::Answered(Validation::Reject(reason)) => Reply::new(553, reason),
            Verdict::TimedOut => Reply::new(451, "Recipient validation timed out"),
            Verdict::ClientClosed => return Ok(Flow::Close(CloseReason::ClosedByClient)),
        };

        self.respond(reply).await
    }

    /// Ask the recipient validator about `recipient`, accepting it if there is no validator.
    ///
    /// Nothing else is read from the client until this returns, but the transport is watched so
    /// that a client closing the stream ends the wait.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Io`] if the transport fails while waiting.
    async fn validate(&mut self, recipient: String) -> Result<Verdict> {
        let Some(validator) = self.server.validator() else {
            return Ok(Verdict::Answered(Validation::Accept(recipient)));
        };

        let (responder, answer) = Responder::new();
        validator.validate(recipient, responder);

        let validation_timeout = self.server.config().validation_timeout;
        let answer = async move {
            match validation_timeout {
                Some(limit) => tokio::time::timeout(limit, answer).await.ok(),
                None => Some(answer.await),
            }
        };

        let answer = tokio::select! {
            biased;

            answer = answer => answer,
            closed = self.transport.closed() => {
                closed?;
                debug!("client closed the stream during recipient validation");
                return Ok(Verdict::ClientClosed);
            }
        };

        let Some(answer) = answer else {
            warn!("recipient validation timed out");
            return Ok(Verdict::TimedOut);
        };

        Ok(Verdict::Answered(answer.unwrap_or_else(|_| {
            warn!("recipient validator dropped its responder without answering");
            Validation::Reject("Recipient validation failed".to_string())
        })))
    }

    /// Reply to the data (`DATA`) command from a client, switching to reading message content.
    ///
    /// [RFC 5321 section 4.1.1.4](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.4).
    async fn data(&mut self) -> Result<Flow> {
        if self.envelope.recipients().is_empty() {
            return self
                .respond(Reply::bad_sequence("Error: need RCPT command"))
                .await;
        }

        self.mode = Mode::Data;
        self.respond(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
            .await
    }

    /// Reply to the reset (`RSET`) command from a client.
    ///
    /// [RFC 5321 section 4.1.1.5](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.5).
    async fn reset(&mut self) -> Result<Flow> {
        self.envelope.reset();

        self.respond(Reply::ok()).await
    }

    /// Reply to the quit (`QUIT`) command from a client.
    ///
    /// [RFC 5321 section 4.1.1.10](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.10).
    async fn quit(&mut self) -> Result<Flow> {
        let text = format!("{} closing connection", self.server.config().hostname);
        self.reply(Reply::new(221, text)).await?;

        Ok(Flow::Close(CloseReason::Quit))
    }

    /// Reply to the `STARTTLS` command from a client.
    ///
    /// Refused on a transport that is already secure, and inside a mail transaction so that one
    /// message is never received partly in plaintext and partly encrypted.
    ///
    /// [RFC 3207 section 4](https://www.rfc-editor.org/rfc/rfc3207.html#section-4).
    async fn start_tls_command(&mut self) -> Result<Flow> {
        if self.transport.is_secure() {
            warn!("STARTTLS received on a secure transport");
            return self
                .respond(Reply::bad_sequence("Error: TLS already active"))
                .await;
        }

        let Some(provider) = self.server.secure_context() else {
            return self
                .respond(Reply::new(454, "TLS not available due to temporary reason"))
                .await;
        };

        if self.envelope.in_transaction() {
            return self
                .respond(Reply::bad_sequence(
                    "Error: STARTTLS not permitted during a mail transaction",
                ))
                .await;
        }

        let config = match provider.secure_context() {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "no secure context for STARTTLS");
                return self
                    .respond(Reply::new(454, "TLS not available due to temporary reason"))
                    .await;
            }
        };

        self.reply(Reply::new(220, "Ready to start TLS")).await?;

        Ok(Flow::StartTls(config))
    }
}
