//! Server builder, accept loop, and per-connection protocol.
//!
//! Each accepted connection gets its own task owning the stream and a
//! receive buffer. Requests on one connection are processed strictly in
//! arrival order, so keep-alive pipelining preserves response order by
//! construction. A per-worker semaphore caps in-flight connections, and a
//! watch channel fans the shutdown signal out to the accept loop and every
//! connection task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::config::Env;
use crate::error::ServerError;
use crate::buffer::ReceiveBuffer;
use crate::handler::Route;
use crate::http::{Request, Response};
use crate::middleware::{Cors, Middleware, Scheme, UpgradeRedirect};
use crate::parser::{BodyDecoder, ParseStatus, body_plan, parse_head};
use crate::pipeline::{ConnectionMeta, IdentityCodec, Outcome, Pipeline, WireCodec};
use crate::router::Router;
use crate::tasks::{TaskDef, TaskRunner};

/// Builder for an embeddable pipeline server.
///
/// ```rust,ignore
/// let mut server = Server::new(Env::from_env()?);
/// server.route(
///     Route::get("/status").handler(|_args| async { Ok(Reply::Text("OK".into())) })?,
/// );
/// server.serve().await?;
/// ```
pub struct Server {
    pub(crate) env: Env,
    routes: Vec<Route>,
    global_middleware: Vec<Arc<dyn Middleware>>,
    tasks: Vec<TaskDef>,
    upgrade_port: Option<u16>,
    codec: Arc<dyn WireCodec>,
}

impl Server {
    pub fn new(env: Env) -> Self {
        Server {
            env,
            routes: Vec::new(),
            global_middleware: Vec::new(),
            tasks: Vec::new(),
            upgrade_port: None,
            codec: Arc::new(IdentityCodec),
        }
    }

    pub fn route(&mut self, route: Route) -> &mut Self {
        self.routes.push(route);
        self
    }

    /// Middleware applied to every route, outermost first.
    pub fn middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.global_middleware.push(middleware);
        self
    }

    pub fn task(&mut self, def: TaskDef) -> &mut Self {
        self.tasks.push(def);
        self
    }

    /// Companion TLS port; plaintext requests are answered with a 307
    /// redirect pointing at it.
    pub fn upgrade_port(&mut self, port: u16) -> &mut Self {
        self.upgrade_port = Some(port);
        self
    }

    /// Install a wire codec, applied when `USE_HTTP_MSYNC_ENCRYPTION` is on.
    pub fn codec(&mut self, codec: Arc<dyn WireCodec>) -> &mut Self {
        self.codec = codec;
        self
    }

    /// Serve with worker-process fan-out per the configured worker count.
    /// In a spawned worker process this call detects the inherited socket
    /// and runs the worker loop directly.
    pub async fn serve(self) -> Result<(), ServerError> {
        crate::workers::serve(self).await
    }

    /// Run a single in-process worker on an existing listener until
    /// `shutdown` resolves. This is the embeddable path and the test path.
    pub async fn serve_until(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) -> Result<(), ServerError> {
        let worker = self.into_worker(worker_instance_id())?;
        worker.run(listener, shutdown).await
    }

    /// Build the per-worker state: router, pipeline, and task runner. Each
    /// worker process builds its own copy, so no request-serving state is
    /// ever shared across workers.
    pub(crate) fn into_worker(self, instance_id: u64) -> Result<Worker, ServerError> {
        let env = Arc::new(self.env);

        let mut global = Vec::new();
        if self.upgrade_port.is_some() {
            global.push(Arc::new(UpgradeRedirect) as Arc<dyn Middleware>);
        }
        if env.cors_enabled {
            global.push(Arc::new(Cors::permissive()) as Arc<dyn Middleware>);
        }
        global.extend(self.global_middleware);

        let mut router = Router::new();
        for mut route in self.routes {
            if !global.is_empty() {
                let mut chain = global.clone();
                chain.extend(route.middleware.drain(..));
                route.middleware = chain;
            }
            for extra in route.middleware.iter().flat_map(|mw| mw.methods()).collect::<Vec<_>>() {
                if !route.methods.contains(&extra) {
                    route.methods.push(extra);
                }
            }
            router.insert(route)?;
        }

        let pipeline = Arc::new(Pipeline::new(&env, router, self.upgrade_port, self.codec));

        let tasks = Arc::new(TaskRunner::new(instance_id, &env));
        for def in self.tasks {
            tasks.register(def);
        }

        Ok(Worker { env, pipeline, tasks })
    }
}

pub(crate) fn worker_instance_id() -> u64 {
    std::env::var(crate::workers::WORKER_ID_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// One worker: an accept loop plus its privately owned pipeline state.
pub(crate) struct Worker {
    env: Arc<Env>,
    pipeline: Arc<Pipeline>,
    tasks: Arc<TaskRunner>,
}

impl Worker {
    pub(crate) async fn run(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) -> Result<(), ServerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = Arc::new(Semaphore::new(self.env.max_concurrency.max(1)));
        let mut connections = JoinSet::new();

        self.tasks.start();
        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "worker accepting connections"
        );

        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    let _ = shutdown_tx.send(true);
                    break;
                }
                permit = concurrency.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    let _ = shutdown_tx.send(true);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let pipeline = self.pipeline.clone();
                        let env = self.env.clone();
                        let rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            handle_connection(stream, peer, pipeline, env, rx).await;
                            drop(permit);
                        });
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "TCP accept error");
                    }
                },
            }
        }

        tracing::info!("worker shutting down");

        // Drain in-flight connections briefly, then cancel the stragglers.
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            connections.abort_all();
        }

        self.tasks.shutdown();
        self.pipeline.close().await;
        drop(listener);

        Ok(())
    }
}

/// Per-connection protocol: accumulate bytes, parse, dispatch, write,
/// repeat while keep-alive holds.
async fn handle_connection(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    pipeline: Arc<Pipeline>,
    env: Arc<Env>,
    mut shutdown: watch::Receiver<bool>,
) {
    let closing = Arc::new(AtomicBool::new(false));
    let meta = ConnectionMeta {
        peer,
        local_addr: stream.local_addr().ok(),
        scheme: Scheme::Http,
        closing: closing.clone(),
    };

    let mut buf = ReceiveBuffer::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        // ── Head: read until the blank separator arrives ──
        let head = loop {
            match parse_head(&mut buf) {
                Ok(ParseStatus::Complete(head)) => break head,
                Ok(ParseStatus::Partial) => {
                    let read = tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            closing.store(true, Ordering::Release);
                            return;
                        }
                        read = stream.read(&mut chunk) => read,
                    };
                    match read {
                        Ok(0) => {
                            closing.store(true, Ordering::Release);
                            return;
                        }
                        Ok(n) => {
                            if env.use_wire_encryption {
                                match pipeline.decode_inbound(chunk[..n].to_vec()) {
                                    Ok(decoded) => buf.extend(&decoded),
                                    Err(err) => {
                                        write_outcome(&mut stream, pipeline.dispatch(Err(err), &meta).await)
                                            .await;
                                        return;
                                    }
                                }
                            } else {
                                buf.extend(&chunk[..n]);
                            }
                        }
                        Err(_) => {
                            closing.store(true, Ordering::Release);
                            return;
                        }
                    }
                }
                Err(err) => {
                    buf.clear();
                    write_outcome(&mut stream, pipeline.dispatch(Err(err), &meta).await).await;
                    return;
                }
            }
        };

        // ── Body acquisition per the header-set policy ──
        let plan = match body_plan(&head) {
            Ok(plan) => plan,
            Err(err) => {
                write_outcome(&mut stream, pipeline.dispatch(Err(err), &meta).await).await;
                return;
            }
        };

        if head.expect_continue && !closing.load(Ordering::Acquire) {
            let interim = if env.use_wire_encryption {
                pipeline.encode_outbound(Response::continue_interim())
            } else {
                Response::continue_interim()
            };
            if stream.write_all(&interim).await.is_err() {
                return;
            }
        }

        let body = match read_body(
            &mut stream,
            &mut buf,
            plan,
            env.request_timeout,
            &mut chunk,
            &pipeline,
            env.use_wire_encryption,
        )
        .await
        {
            Ok(body) => body,
            Err(err) => {
                write_outcome(&mut stream, pipeline.dispatch(Err(err), &meta).await).await;
                return;
            }
        };

        let request = Request {
            method: head.method,
            target: head.target,
            path: head.path,
            query: head.query,
            version: head.version,
            headers: head.headers,
            body,
            peer: Some(peer),
            received_at: Instant::now(),
        };
        let wants_close = request.wants_close();

        // ── One response per request ──
        let outcome = pipeline.dispatch(Ok(request), &meta).await;
        if !write_outcome(&mut stream, outcome).await {
            return;
        }

        if wants_close || *shutdown.borrow() {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

/// Write the machine's outcome. Returns false when the connection is done.
async fn write_outcome(stream: &mut TcpStream, outcome: Outcome) -> bool {
    match outcome {
        Outcome::Write { bytes, permit } => {
            let written = stream.write_all(&bytes).await.is_ok();
            drop(permit);
            written
        }
        Outcome::Abort => {
            let _ = stream.shutdown().await;
            false
        }
    }
}

/// Drive the body decoder, pulling more bytes as needed, bounded by the
/// request timeout. Continuation reads pass through the same inbound
/// codec as the head when wire encryption is enabled.
async fn read_body(
    stream: &mut TcpStream,
    buf: &mut ReceiveBuffer,
    plan: crate::parser::BodyPlan,
    timeout: Duration,
    chunk: &mut [u8],
    pipeline: &Pipeline,
    decode_inbound: bool,
) -> Result<Vec<u8>, ServerError> {
    let mut decoder = BodyDecoder::new(plan);

    let read = async {
        loop {
            match decoder.advance(buf)? {
                ParseStatus::Complete(body) => return Ok(body),
                ParseStatus::Partial => {
                    let n = stream
                        .read(chunk)
                        .await
                        .map_err(|err| ServerError::BadRequest(err.to_string()))?;
                    if n == 0 {
                        return Err(ServerError::BadRequest(
                            "connection closed mid-body".to_string(),
                        ));
                    }
                    if decode_inbound {
                        let decoded = pipeline.decode_inbound(chunk[..n].to_vec())?;
                        buf.extend(&decoded);
                    } else {
                        buf.extend(&chunk[..n]);
                    }
                }
            }
        }
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ServerError::Timeout("body read exceeded request timeout".to_string()))?
}
