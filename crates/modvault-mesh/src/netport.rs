//! Listen-port selection and persistence.
//!
//! First start: pick a random port in the conventional range, fall back to
//! the IANA dynamic range, and prove availability by actually opening a
//! listener. The winner is persisted under the cache root (obfuscated file
//! name, decimal ASCII) and reused on later starts as long as it is still
//! free; a port stolen by another process gets replaced and the file is
//! rewritten.

use std::io;
use std::net::Ipv4Addr;

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::net::TcpListener;

use modvault_core::CachePaths;

/// Conventional mesh listen ports, tried first.
pub const PREFERRED_PORTS: std::ops::RangeInclusive<u16> = 6881..=6889;

/// IANA dynamic/private range used as fallback.
pub const DYNAMIC_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Random probes into the dynamic range before giving up.
const DYNAMIC_ATTEMPTS: usize = 32;

/// Whether a listening socket can be opened on `port`.
pub async fn port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await.is_ok()
}

/// Select the listen port, reusing the persisted one when possible.
pub async fn select_listen_port(paths: &CachePaths) -> io::Result<u16> {
    let port_file = paths.port_file();

    if let Ok(text) = tokio::fs::read_to_string(&port_file).await {
        if let Ok(port) = text.trim().parse::<u16>() {
            if port_available(port).await {
                tracing::debug!(target: "modvault.mesh", port, "reusing persisted listen port");
                return Ok(port);
            }
            tracing::info!(
                target: "modvault.mesh",
                port,
                "persisted listen port no longer available, selecting a new one"
            );
        }
    }

    let port = pick_fresh_port().await?;
    if let Some(parent) = port_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&port_file, port.to_string()).await?;
    tracing::info!(target: "modvault.mesh", port, "selected listen port");
    Ok(port)
}

async fn pick_fresh_port() -> io::Result<u16> {
    let mut preferred: Vec<u16> = PREFERRED_PORTS.collect();
    preferred.shuffle(&mut rand::thread_rng());
    for port in preferred {
        if port_available(port).await {
            return Ok(port);
        }
    }

    for _ in 0..DYNAMIC_ATTEMPTS {
        let port = rand::thread_rng().gen_range(DYNAMIC_PORTS);
        if port_available(port).await {
            return Ok(port);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no listen port available in preferred or dynamic range",
    ))
}
