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

use std::{
    error::Error,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{pin_mut, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    read_line, timeouts, write_fmt_line, write_line, CloseReason, Config, Responder, Server,
};


type Result = std::result::Result<(), Box<dyn Error>>;

/// The result a spawned session finishes with.
type Session = JoinHandle<crate::Result<CloseReason>>;

const GREETING: &str = "220 mx.test smtp_intake 1.0\r\n";

fn peer() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 25000))
}

fn config() -> Config {
    Config::builder("mx.test").version("1.0").build()
}

/// The client end of a session.
struct Client<S> {
    stream: BufReader<S>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Write raw bytes, without adding a line ending.
    async fn send(&mut self, text: &str) -> io::Result<()> {
        let writer = self.stream.get_mut();

        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    }

    /// Read one complete reply, which may span several lines.
    async fn reply(&mut self) -> io::Result<String> {
        let mut reply = String::new();

        loop {
            let line = read_line!(self.stream).await?;
            if line.is_empty() {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            assert!(is_valid_response::reply_line(&line), "{line:?}");
            reply.push_str(&line);

            if is_valid_response::last_line(&line) {
                return Ok(reply);
            }
        }
    }

    /// Send a line and read the reply to it.
    async fn command(&mut self, line: &str) -> io::Result<String> {
        write_fmt_line!(self.stream.get_mut(), "{line}")?;
        self.stream.get_mut().flush().await?;

        self.reply().await
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Start a session over an in-memory stream, and read the greeting.
async fn open(server: &Server) -> io::Result<(Client<DuplexStream>, Session)> {
    let (client, stream) = tokio::io::duplex(4096);
    let session = server.spawn(stream, peer());

    let mut client = Client::new(client);
    assert_eq!(client.reply().await?, GREETING);

    Ok((client, session))
}

#[tokio::test]
async fn test_mail_transaction() -> Result {
    let (server, mut incoming) = Server::new(config());
    let (mut client, session) = open(&server).await?;

    assert_eq!(
        client.command("EHLO there").await?,
        "250-mx.test Hello 192.0.2.1\r\n250 STARTTLS\r\n"
    );
    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    assert_eq!(client.command("RCPT TO:<c@d.com>").await?, "250 Ok\r\n");
    assert_eq!(
        client.command("DATA").await?,
        "354 End data with <CR><LF>.<CR><LF>\r\n"
    );

    client.send("Subject: hi\r\n").await?;
    assert_eq!(client.command(".").await?, "250 Ok\r\n");

    let message = incoming.recv().await.ok_or("no message")?;
    assert_eq!(message.sender, "a@b.com");
    assert_eq!(message.recipients, ["c@d.com"]);
    assert_eq!(message.body, ["Subject: hi"]);
    assert_eq!(message.remote_address, peer());
    assert!(!message.secure);

    assert_eq!(
        client.command("QUIT").await?,
        "221 mx.test closing connection\r\n"
    );
    assert_eq!(session.await??, CloseReason::Quit);

    Ok(())
}

#[tokio::test]
async fn test_unknown_and_malformed_commands() -> Result {
    let (server, _incoming) = Server::new(config());
    let (mut client, _session) = open(&server).await?;

    assert_eq!(
        client.command("VRFY smith").await?,
        "502 Error: command \"VRFY\" not implemented\r\n"
    );
    assert_eq!(
        client.command("expn staff").await?,
        "502 Error: command \"EXPN\" not implemented\r\n"
    );
    assert_eq!(client.command("HI").await?, "500 Error: bad syntax\r\n");
    assert_eq!(client.command("").await?, "500 Error: bad syntax\r\n");
    assert_eq!(client.command("HELO").await?, "501 Syntax: HELO hostname\r\n");
    assert_eq!(client.command("NOOP now").await?, "501 Syntax: NOOP\r\n");
    assert_eq!(
        client.command("MAIL TO:<a@b.com>").await?,
        "501 Syntax: MAIL FROM:<address>\r\n"
    );
    assert_eq!(
        client.command("MAIL FROM:<a@b.com> SIZE=100").await?,
        "501 Syntax: MAIL FROM:<address>\r\n"
    );
    assert_eq!(client.command("noop").await?, "250 Ok\r\n");

    Ok(())
}

#[tokio::test]
async fn test_command_sequence() -> Result {
    let (server, _incoming) = Server::new(config());
    let (mut client, _session) = open(&server).await?;

    assert_eq!(
        client.command("RCPT TO:<c@d.com>").await?,
        "503 Error: need MAIL command\r\n"
    );
    assert_eq!(
        client.command("DATA").await?,
        "503 Error: need RCPT command\r\n"
    );

    assert!(is_valid_response::helo(&client.command("HELO there").await?));
    assert_eq!(
        client.command("EHLO again").await?,
        "503 Duplicate HELO/EHLO\r\n"
    );

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    assert_eq!(
        client.command("MAIL FROM:<a@b.com>").await?,
        "503 Error: nested MAIL command\r\n"
    );
    assert_eq!(
        client.command("DATA").await?,
        "503 Error: need RCPT command\r\n"
    );
    assert_eq!(
        client.command("RCPT TO:<>").await?,
        "501 Syntax: RCPT TO: <address>\r\n"
    );

    assert_eq!(client.command("RSET").await?, "250 Ok\r\n");
    assert_eq!(
        client.command("RCPT TO:<c@d.com>").await?,
        "503 Error: need MAIL command\r\n"
    );
    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");

    Ok(())
}

#[tokio::test]
async fn test_data_transparency() -> Result {
    let (server, mut incoming) = Server::new(config());
    let (mut client, _session) = open(&server).await?;

    assert!(client
        .command("EHLO there")
        .await?
        .ends_with("250 STARTTLS\r\n"));
    assert_eq!(client.command("MAIL FROM:<>").await?, "250 Ok\r\n");
    assert_eq!(client.command("RCPT TO:c@d.com").await?, "250 Ok\r\n");
    assert_eq!(client.command("RCPT TO:<e@f.com>").await?, "250 Ok\r\n");
    assert!(client.command("DATA").await?.starts_with("354 "));

    client
        .send("..leading dot\r\nHELO inside data\r\n\r\n.\r\n")
        .await?;
    assert_eq!(client.reply().await?, "250 Ok\r\n");

    let message = incoming.recv().await.ok_or("no message")?;
    assert_eq!(message.sender, "");
    assert_eq!(message.recipients, ["c@d.com", "e@f.com"]);
    assert_eq!(message.body, [".leading dot", "HELO inside data", ""]);
    assert_eq!(message.data(), ".leading dot\r\nHELO inside data\r\n");

    // The transaction is over, but the greeting is remembered.
    assert_eq!(
        client.command("RCPT TO:<c@d.com>").await?,
        "503 Error: need MAIL command\r\n"
    );
    assert_eq!(
        client.command("HELO there").await?,
        "503 Duplicate HELO/EHLO\r\n"
    );

    Ok(())
}

#[tokio::test]
async fn test_recipient_validation() -> Result {
    let validator = |address: String, responder: Responder| {
        if address.ends_with("@blocked.test") {
            responder.reject("Recipient address rejected");
        } else {
            responder.accept(address.to_lowercase());
        }
    };
    let (server, mut incoming) = Server::new(config());
    let server = server.with_validator(validator);
    let (mut client, _session) = open(&server).await?;

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    assert_eq!(
        client.command("RCPT TO:<x@blocked.test>").await?,
        "553 Recipient address rejected\r\n"
    );
    assert_eq!(client.command("RCPT TO:<C@D.com>").await?, "250 Ok\r\n");
    assert!(client.command("DATA").await?.starts_with("354 "));
    assert_eq!(client.command(".").await?, "250 Ok\r\n");

    let message = incoming.recv().await.ok_or("no message")?;
    assert_eq!(message.recipients, ["c@d.com"]);
    assert!(message.body.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_validation_blocks_later_commands() -> Result {
    let (requests, mut pending) = mpsc::unbounded_channel();
    let validator = move |address: String, responder: Responder| {
        let _ = requests.send((address, responder));
    };
    let (server, _incoming) = Server::new(config());
    let server = server.with_validator(validator);
    let (mut client, _session) = open(&server).await?;

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");

    // Pipelined: the `NOOP` must not be answered before the `RCPT`.
    client.send("RCPT TO:<c@d.com>\r\nNOOP\r\n").await?;

    let (address, responder) = pending.recv().await.ok_or("no validation request")?;
    assert_eq!(address, "c@d.com");

    let early = tokio::time::timeout(Duration::from_millis(100), client.reply()).await;
    assert!(early.is_err(), "replied before validation finished");

    responder.reject("No such user here");

    assert_eq!(client.reply().await?, "553 No such user here\r\n");
    assert_eq!(client.reply().await?, "250 Ok\r\n");

    Ok(())
}

#[tokio::test]
async fn test_close_during_validation() -> Result {
    let (requests, mut pending) = mpsc::unbounded_channel();
    let validator = move |address: String, responder: Responder| {
        let _ = requests.send((address, responder));
    };
    let (server, _incoming) = Server::new(config());
    let server = server.with_validator(validator);
    let (mut client, session) = open(&server).await?;

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    client.send("RCPT TO:<c@d.com>\r\n").await?;

    // Held and never answered.
    let (_, _responder) = pending.recv().await.ok_or("no validation request")?;
    drop(client);

    let outcome = tokio::time::timeout(Duration::from_secs(1), session).await??;
    assert_eq!(outcome?, CloseReason::ClosedByClient);
    assert_eq!(server.stats().connections_current, 0);

    Ok(())
}

#[tokio::test]
async fn test_validation_failures() -> Result {
    let waiting = Arc::new(Mutex::new(Vec::new()));
    let held = Arc::clone(&waiting);
    let validator = move |address: String, responder: Responder| {
        if address.starts_with("slow@") {
            held.lock().unwrap().push(responder);
        } else {
            drop(responder);
        }
    };
    let config = Config::builder("mx.test")
        .validation_timeout(Duration::from_millis(50))
        .build();
    let (server, _incoming) = Server::new(config);
    let server = server.with_validator(validator);

    let (client, stream) = tokio::io::duplex(4096);
    let _session = server.spawn(stream, peer());
    let mut client = Client::new(client);
    assert!(is_valid_response::server_greeting(&client.reply().await?));

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    assert_eq!(
        client.command("RCPT TO:<slow@d.com>").await?,
        "451 Recipient validation timed out\r\n"
    );
    assert_eq!(
        client.command("RCPT TO:<gone@d.com>").await?,
        "553 Recipient validation failed\r\n"
    );
    assert_eq!(
        client.command("DATA").await?,
        "503 Error: need RCPT command\r\n"
    );
    assert_eq!(waiting.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_closed_intake() -> Result {
    let (server, incoming) = Server::new(config());
    drop(incoming);
    let (mut client, _session) = open(&server).await?;

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    assert_eq!(client.command("RCPT TO:<c@d.com>").await?, "250 Ok\r\n");
    assert!(client.command("DATA").await?.starts_with("354 "));
    assert_eq!(
        client.command(".").await?,
        "451 Requested action aborted: local error in processing\r\n"
    );
    assert_eq!(server.stats().messages_total, 0);

    Ok(())
}

#[tokio::test]
async fn test_idle_timeout() -> Result {
    let config = Config::builder("mx.test")
        .idle_timeout(Duration::from_millis(50))
        .build();
    let (server, _incoming) = Server::new(config);

    let (client, stream) = tokio::io::duplex(4096);
    let session = server.spawn(stream, peer());
    let mut client = Client::new(client);
    assert!(is_valid_response::server_greeting(&client.reply().await?));

    assert_eq!(
        client.reply().await?,
        "421 mx.test Error: timeout exceeded\r\n"
    );
    assert!(matches!(session.await??, CloseReason::TimedOut(_)));

    Ok(())
}

#[tokio::test]
async fn test_client_disconnect() -> Result {
    let (server, _incoming) = Server::new(config());
    let (mut client, session) = open(&server).await?;

    assert_eq!(client.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    drop(client);

    assert_eq!(session.await??, CloseReason::ClosedByClient);
    assert_eq!(server.stats().connections_current, 0);

    Ok(())
}

#[tokio::test]
async fn test_stats() -> Result {
    let (server, _incoming) = Server::new(config());

    let (mut first, first_session) = open(&server).await?;
    let (mut second, second_session) = open(&server).await?;

    let stats = server.stats();
    assert_eq!(stats.connections_current, 2);
    assert_eq!(stats.connections_max, 2);

    assert_eq!(first.command("MAIL FROM:<a@b.com>").await?, "250 Ok\r\n");
    assert_eq!(first.command("RCPT TO:<c@d.com>").await?, "250 Ok\r\n");
    assert!(first.command("DATA").await?.starts_with("354 "));
    assert_eq!(first.command(".").await?, "250 Ok\r\n");

    assert!(is_valid_response::quit(&first.command("QUIT").await?));
    assert!(is_valid_response::quit(&second.command("QUIT").await?));
    first_session.await??;
    second_session.await??;

    let stats = server.stats();
    assert_eq!(stats.messages_total, 1);
    assert_eq!(stats.connections_current, 0);
    assert_eq!(stats.connections_max, 2);
    assert_eq!(stats.connections_total, 2);

    Ok(())
}

#[tokio::test]
async fn test_scripted_session() -> Result {
    let (server, _incoming) = Server::new(config());
    let stream = tokio_test::io::Builder::new()
        .write(GREETING.as_bytes())
        .read(b"NOOP\r\n")
        .write(b"250 Ok\r\n")
        .read(b"QUIT\r\n")
        .write(b"221 mx.test closing connection\r\n")
        .build();

    let outcome = server.serve(stream, peer()).await;

    assert_eq!(tokio_test::assert_ok!(outcome), CloseReason::Quit);

    Ok(())
}

// 4.5.1 Minimum Implementation:
//
// - [x] `EHLO`
// - [x] `HELO`
// - [x] `MAIL`
// - [x] `RCPT`
// - [x] `DATA`
// - [x] `RSET`
// - [x] `NOOP`
// - [ ] `VRFY`
// - [x] `QUIT`
//
// <https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.1>
#[tokio::test]
async fn test_listen() -> Result {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;

    let (server, _incoming) = Server::new(config());
    let stream = server.listen(listener);

    // Can be bound to a variable which exposes `.abort()`
    tokio::spawn(async move {
        pin_mut!(stream);

        loop {
            // Get the `Next` and unwrap it
            let session = stream
                .next()
                .await
                .unwrap()
                // Unwrap the [`TcpListener::accept`]
                .unwrap()
                // Await and unwrap the [`JoinHandle`]
                .await
                .unwrap();

            // Unwrap the session itself
            session.unwrap();
        }
    });

    let mut stream = TcpStream::connect(address).await?;
    let (read_stream, mut write_stream) = stream.split();

    let mut reader = BufReader::new(read_stream);

    assert_eq!(read_line!(reader).await?, GREETING);

    write_line!(write_stream, "HELO there")?;
    let reply = read_line!(reader).await?;
    assert!(is_valid_response::helo(&reply));
    assert!(reply.ends_with("Hello 127.0.0.1\r\n"));

    write_line!(write_stream, "QUIT")?;
    assert!(is_valid_response::quit(&read_line!(reader).await?));

    // The server closes its end after `QUIT`.
    assert_eq!(read_line!(reader).await?, "");

    Ok(())
}

#[test]
fn test_recommended_timeouts() {
    let config = Config::builder("mx.test")
        .idle_timeout(timeouts::SERVER_TIMEOUT)
        .build();

    assert_eq!(config.idle_timeout, Some(timeouts::EXPECTED));
}
