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

//! A standalone SMTP submission listener built on `smtp_intake`.
//!
//! Accepts mail on one address, optionally offers `STARTTLS`, and prints every message it
//! receives to standard output.

#![warn(clippy::nursery, clippy::pedantic)]

use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use futures_util::{pin_mut, StreamExt};
use rustls::ServerConfig;
use smtp_intake::{timeouts, Config, Incoming, Message, Responder, Server};
use structopt::StructOpt;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp_intake_daemon",
    about = "Accepts mail over SMTP and prints every message it receives"
)]
struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "127.0.0.1")]
    address: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "2525")]
    port: u16,

    /// Hostname announced in the greeting and replies
    #[structopt(long = "hostname", default_value = "localhost")]
    hostname: String,

    /// TLS certificate chain (PEM), enables STARTTLS together with --tls-key
    #[structopt(long = "tls-cert", parse(from_os_str))]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    tls_key: Option<PathBuf>,

    /// Reject recipients at this domain (can be specified multiple times)
    #[structopt(long = "reject-domain", number_of_values = 1)]
    reject_domains: Vec<String>,

    /// Seconds to wait for the next line from a client (default: 300)
    #[structopt(long = "idle-timeout-secs")]
    idle_timeout_secs: Option<u64>,

    /// Log every command and reply
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let default_filter = if opt.verbose {
        "smtp_intake=debug,smtp_intake_daemon=debug"
    } else {
        "smtp_intake=info,smtp_intake_daemon=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let idle_timeout = opt
        .idle_timeout_secs
        .map_or(timeouts::SERVER_TIMEOUT, Duration::from_secs);
    let config = Config::builder(opt.hostname.clone())
        .idle_timeout(idle_timeout)
        .validation_timeout(timeouts::RCPT)
        .handshake_timeout(timeouts::TLS_HANDSHAKE)
        .build();

    let (mut server, incoming) = Server::new(config);

    match (&opt.tls_cert, &opt.tls_key) {
        (Some(cert), Some(key)) => {
            server = server.with_secure_context(load_tls(cert, key)?);
            info!(cert = %cert.display(), "STARTTLS enabled");
        }
        (None, None) => info!("no TLS credentials given, STARTTLS disabled"),
        _ => bail!("--tls-cert and --tls-key must be given together"),
    }

    if !opt.reject_domains.is_empty() {
        server = server.with_validator(domain_filter(opt.reject_domains.clone()));
    }

    let address: SocketAddr = format!("{}:{}", opt.address, opt.port)
        .parse()
        .with_context(|| format!("invalid listening address {}:{}", opt.address, opt.port))?;
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    let sessions = server.listen(listener);
    tokio::spawn(async move {
        pin_mut!(sessions);

        while let Some(accepted) = sessions.next().await {
            if let Err(error) = accepted {
                warn!(%error, "failed to accept a connection");
            }
        }
    });

    let stats = server.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;

        loop {
            interval.tick().await;
            stats.log_stats();
        }
    });

    tokio::select! {
        () = print_messages(incoming) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
    }

    server.log_stats();

    Ok(())
}

/// Load a certificate chain and private key from PEM files.
fn load_tls(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
    let mut reader = BufReader::new(
        File::open(cert).with_context(|| format!("failed to open {}", cert.display()))?,
    );
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read certificates from {}", cert.display()))?;

    if chain.is_empty() {
        bail!("no certificates in {}", cert.display());
    }

    let mut reader = BufReader::new(
        File::open(key).with_context(|| format!("failed to open {}", key.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to read private key from {}", key.display()))?
        .with_context(|| format!("no private key in {}", key.display()))?;

    Ok(smtp_intake::tls::server_config(chain, key)?)
}

/// A recipient validator that rejects every address at one of `domains`.
fn domain_filter(domains: Vec<String>) -> impl Fn(String, Responder) + Send + Sync + 'static {
    move |address: String, responder: Responder| {
        let rejected = address.rsplit_once('@').is_some_and(|(_, domain)| {
            domains
                .iter()
                .any(|rejected| rejected.eq_ignore_ascii_case(domain))
        });

        if rejected {
            responder.reject(format!("<{address}>: Recipient address rejected"));
        } else {
            responder.accept(address);
        }
    }
}

/// Print every received message until the server is gone.
async fn print_messages(mut incoming: Incoming) {
    while let Some(message) = incoming.recv().await {
        print_message(&message);
    }
}

fn print_message(message: &Message) {
    println!(
        "--- message on connection {} from {}{}",
        message.connection,
        message.remote_address,
        if message.secure { " (TLS)" } else { "" }
    );
    println!("From: <{}>", message.sender);
    for recipient in &message.recipients {
        println!("To: <{recipient}>");
    }
    println!();
    println!("{}", message.data());
}
