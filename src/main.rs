//! evsock entry point.
//!
//! Runs an echo server configured from the environment: every message a
//! client sends is written back to it with the same text/binary type.

use std::process::ExitCode;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing_subscriber::EnvFilter;

use evsock::{Clients, Event, EventHandler, Server, ServerConfig, ServerError};

/// Echoes every message back to its sender.
#[derive(Debug, Default)]
struct Echo {
    served: u64,
}

impl EventHandler for Echo {
    fn on_connect(&mut self, clients: &mut Clients<'_>, event: &Event) {
        tracing::info!(
            connection = %event.connection,
            peer = %clients.address(event.connection).unwrap_or_default(),
            tls = event.tls,
            clients = clients.len(),
            "client connected"
        );
    }

    fn on_data(&mut self, clients: &mut Clients<'_>, event: &Event) {
        let Some(received) = &event.received else {
            return;
        };
        let written = if received.is_binary() {
            clients.write_binary(event.connection, &received.data)
        } else {
            clients.write(event.connection, &received.data)
        };
        match written {
            Ok(len) => {
                self.served += 1;
                tracing::debug!(connection = %event.connection, len, "echoed");
            }
            Err(err) => {
                tracing::warn!(connection = %event.connection, %err, "echo failed, dropping client");
                clients.delete(event.connection);
            }
        }
    }

    fn on_disconnect(&mut self, _clients: &mut Clients<'_>, event: &Event) {
        tracing::info!(connection = %event.connection, "client disconnected");
    }

    fn on_error(&mut self, _clients: &mut Clients<'_>, event: &Event) {
        tracing::warn!(connection = %event.connection, "client dropped after protocol error");
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    match run() {
        Ok(served) => {
            tracing::info!(served, "stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(%err, code = err.exit_code(), "server failed");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run() -> Result<u64, ServerError> {
    let config = ServerConfig::from_env()?;
    tracing::info!(listen = %config.listen, "starting evsock");

    let mut server = Server::bind(config, Echo::default())?;

    let shutdown = server.shutdown_handle();
    for signal in [SIGINT, SIGTERM] {
        flag::register(signal, shutdown.flag()).map_err(ServerError::Socket)?;
    }

    server.run()?;
    Ok(server.handler().served)
}

/// Installs the tracing subscriber. `RUST_LOG` selects levels (default
/// `info`); `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
