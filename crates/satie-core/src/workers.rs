//! Worker-process fan-out over a shared listening socket.
//!
//! The parent binds the TCP socket (SO_REUSEADDR, non-blocking) and marks
//! its descriptor inheritable, then spawns N copies of the current
//! executable with `SATIE_WORKER_FD` / `SATIE_WORKER_ID` markers. Each
//! worker process runs the user's `main` again; `Server::serve` detects
//! the marker, rebuilds the listener from the inherited descriptor,
//! re-initializes all per-worker state (router, limiters, breaker, cache,
//! tasks), and enters its own accept loop. The parent serves nothing: it
//! owns the socket and the child lifecycles, forwards SIGTERM on
//! shutdown, and reaps the children.

use tokio::net::TcpListener;

use crate::config::Env;
use crate::error::ServerError;
use crate::server::Server;
#[cfg(unix)]
use crate::server::worker_instance_id;

#[cfg(unix)]
pub(crate) const WORKER_FD_ENV: &str = "SATIE_WORKER_FD";
pub(crate) const WORKER_ID_ENV: &str = "SATIE_WORKER_ID";

/// Entry point behind `Server::serve`.
pub(crate) async fn serve(server: Server) -> Result<(), ServerError> {
    #[cfg(unix)]
    if let Some(listener) = inherited_listener()? {
        tracing::info!(worker = worker_instance_id(), "worker process started");
        return server.serve_until(listener, shutdown_signal()).await;
    }

    let workers = server.env.workers;
    if workers <= 1 {
        let listener = bind_listener(&server.env, false)?;
        return server.serve_until(listener, shutdown_signal()).await;
    }

    serve_fanout(server, workers).await
}

#[cfg(unix)]
async fn serve_fanout(server: Server, workers: usize) -> Result<(), ServerError> {
    parent_fanout(server, workers).await
}

/// Process fan-out needs descriptor inheritance; fall back to one
/// in-process worker elsewhere.
#[cfg(not(unix))]
async fn serve_fanout(server: Server, _workers: usize) -> Result<(), ServerError> {
    tracing::warn!("worker fan-out is unix-only; serving in-process");
    let listener = bind_listener(&server.env, false)?;
    server.serve_until(listener, shutdown_signal()).await
}

/// Bind the listening socket: SO_REUSEADDR, non-blocking, and (for
/// fan-out) inheritable by child processes.
fn bind_listener(env: &Env, inheritable: bool) -> Result<TcpListener, ServerError> {
    let socket = bind_socket(env, inheritable)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(ServerError::from)
}

fn bind_socket(env: &Env, inheritable: bool) -> Result<socket2::Socket, ServerError> {
    let addr: std::net::SocketAddr = env
        .server_addr()
        .parse()
        .map_err(|_| ServerError::Internal(format!("invalid bind address: {}", env.server_addr())))?;

    let socket = socket2::Socket::new(
        if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    #[cfg(unix)]
    if inheritable {
        set_inheritable(&socket)?;
    }
    #[cfg(not(unix))]
    let _ = inheritable;

    Ok(socket)
}

#[cfg(unix)]
fn set_inheritable(socket: &socket2::Socket) -> Result<(), ServerError> {
    use std::os::fd::AsRawFd;

    // Clear FD_CLOEXEC so spawned workers inherit the descriptor.
    let fd = socket.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(ServerError::Internal("fcntl(F_GETFD) failed".to_string()));
    }
    let cleared = flags & !libc::FD_CLOEXEC;
    if unsafe { libc::fcntl(fd, libc::F_SETFD, cleared) } < 0 {
        return Err(ServerError::Internal("fcntl(F_SETFD) failed".to_string()));
    }
    Ok(())
}

/// Rebuild the listener a worker process inherited from its parent.
#[cfg(unix)]
fn inherited_listener() -> Result<Option<TcpListener>, ServerError> {
    use std::os::fd::FromRawFd;

    let Some(raw) = std::env::var(WORKER_FD_ENV).ok() else {
        return Ok(None);
    };
    let fd: i32 = raw
        .parse()
        .map_err(|_| ServerError::Internal(format!("invalid {WORKER_FD_ENV}: {raw}")))?;

    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    Ok(Some(listener))
}

/// Parent side: bind, spawn N workers inheriting the socket, wait for a
/// shutdown signal, forward SIGTERM, and reap.
#[cfg(unix)]
async fn parent_fanout(server: Server, workers: usize) -> Result<(), ServerError> {
    use std::os::fd::AsRawFd;

    let socket = bind_socket(&server.env, true)?;
    let fd = socket.as_raw_fd();
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    tracing::info!(
        workers,
        addr = %server.env.server_addr(),
        "spawning worker processes over the shared socket"
    );

    let mut children = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let child = tokio::process::Command::new(&exe)
            .args(&args)
            .env(WORKER_FD_ENV, fd.to_string())
            .env(WORKER_ID_ENV, worker_id.to_string())
            .spawn()
            .map_err(|err| ServerError::Internal(format!("failed to spawn worker: {err}")))?;
        tracing::debug!(worker_id, pid = child.id(), "worker spawned");
        children.push(child);
    }

    shutdown_signal().await;
    tracing::info!("shutting down worker pool");

    for child in &children {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    for mut child in children {
        let _ = child.wait().await;
    }

    // The shared socket closes with the parent.
    drop(socket);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
