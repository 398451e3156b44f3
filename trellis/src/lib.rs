//! Trellis &ndash; an HTTP routing and dispatch engine for high-throughput
//! services.
//!
//! Trellis maps an incoming method + path onto a registered handler through a
//! radix route tree, composes middleware around it, binds strongly-typed
//! request values with structured validation errors, and manages long-lived
//! duplex (WebSocket) and push (Server-Sent Events) connections.
#![warn(missing_docs, deprecated)]
#![doc(test(no_crate_inject, attr(deny(warnings))))]

// Lets the derive macros resolve `::trellis` paths from within this crate's
// own tests.
extern crate self as trellis;

pub mod binder;
pub mod config;
pub mod error;
pub mod handler;
pub mod helpers;
pub mod middleware;
pub mod observer;
pub mod prelude;
pub mod router;
mod service;
pub mod state;
pub mod stream;

/// Re-exported so applications depend on the same `hyper` the framework was
/// built against.
pub use hyper;

use std::net::{SocketAddr, ToSocketAddrs};

use log::info;
use tokio::net::TcpListener;
use tokio::runtime::{self, Runtime};

use crate::error::StartError;
use crate::router::Router;
use crate::service::ConnectedService;

/// Starts an application on the given address with the default number of
/// worker threads.
pub fn start<A>(addr: A, router: Router) -> Result<(), StartError>
where
    A: ToSocketAddrs + 'static,
{
    start_with_num_threads(addr, router, num_cpus::get())
}

/// Starts an application with a designated number of worker threads.
pub fn start_with_num_threads<A>(
    addr: A,
    router: Router,
    threads: usize,
) -> Result<(), StartError>
where
    A: ToSocketAddrs + 'static,
{
    let runtime = new_runtime(threads)?;
    runtime.block_on(init_server(addr, router))
}

/// Returns a future that binds the listener and serves connections forever.
///
/// This is what `start` drives; it is exposed so the server can be spawned on
/// an existing runtime, combined with shutdown signals, or raced against
/// other futures.
pub async fn init_server<A>(addr: A, router: Router) -> Result<(), StartError>
where
    A: ToSocketAddrs + 'static,
{
    let addr = resolve_addr(addr)?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(StartError::Bind)?;
    let addr = listener.local_addr().map_err(StartError::Bind)?;

    info!(target: "trellis::start", "listening on http://{}", addr);

    bind_server(listener, router).await
}

async fn bind_server(listener: TcpListener, router: Router) -> Result<(), StartError> {
    loop {
        let (socket, peer) = listener.accept().await.map_err(StartError::Accept)?;
        let service = ConnectedService::new(router.clone(), peer);

        tokio::spawn(async move {
            let http = hyper::server::conn::Http::new();
            // `with_upgrades` keeps the connection alive past a 101 response
            // so duplex streams can take over the socket.
            if let Err(err) = http
                .serve_connection(socket, service)
                .with_upgrades()
                .await
            {
                log::debug!("connection closed with error: {}", err);
            }
        });
    }
}

fn new_runtime(threads: usize) -> Result<Runtime, StartError> {
    runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("trellis-worker")
        .enable_all()
        .build()
        .map_err(StartError::Runtime)
}

fn resolve_addr<A>(addr: A) -> Result<SocketAddr, StartError>
where
    A: ToSocketAddrs,
{
    match addr.to_socket_addrs().map(|mut i| i.next()) {
        Ok(Some(addr)) => Ok(addr),
        Ok(None) | Err(_) => Err(StartError::AddrResolve),
    }
}
