//! Blocking client façade.
//!
//! A [`Dispatcher`] is single-threaded, so the façade runs one on a dedicated
//! worker thread together with its tokio [`Driver`]. Callers on any thread
//! talk to it through a cloneable [`ClientHandle`]; each call sends a request
//! over a channel and blocks on a reply channel until the completion for that
//! operation arrives.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use crossbeam_channel::{Sender, unbounded};
use tokio::{select, sync::mpsc};
use tracing::{debug, info};

use crate::callbacks::{Completion, Cookie};
use crate::command::{Request, Response};
use crate::dispatch::Dispatcher;
use crate::driver::Driver;
use crate::error::{ErrorKind, OpError};
use crate::io::StaticConfig;
use crate::settings::Settings;
use crate::topology::TopologySnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub server: String,
    pub key: String,
    pub value: String,
}

/// Handle for submitting operations to a running client worker.
#[derive(Clone)]
pub struct ClientHandle {
    request_tx: mpsc::UnboundedSender<ClientRequest>,
}

impl ClientHandle {
    /// Fetches `key`. A missing key is `Ok(None)`.
    pub fn get(&self, key: impl Into<Bytes>) -> Result<Option<GetResult>> {
        let (resp_tx, resp_rx) = unbounded();
        self.send(ClientRequest::Op {
            request: Request::get(key),
            responder: Responder::Get(resp_tx),
        })?;
        resp_rx.recv().context("get response channel closed")?
    }

    /// Stores `value` under `key` unconditionally. Returns the new CAS.
    pub fn upsert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<u64> {
        let (resp_tx, resp_rx) = unbounded();
        self.send(ClientRequest::Op {
            request: Request::upsert(key, value),
            responder: Responder::Cas(resp_tx),
        })?;
        resp_rx.recv().context("upsert response channel closed")?
    }

    /// Removes `key`. Returns false if it did not exist.
    pub fn remove(&self, key: impl Into<Bytes>) -> Result<bool> {
        let (resp_tx, resp_rx) = unbounded();
        self.send(ClientRequest::Op {
            request: Request::remove(key),
            responder: Responder::Remove(resp_tx),
        })?;
        resp_rx.recv().context("remove response channel closed")?
    }

    /// Adds `delta` to the counter at `key`, creating it with `initial` if given.
    pub fn counter(&self, key: impl Into<Bytes>, delta: i64, initial: Option<u64>) -> Result<u64> {
        let (resp_tx, resp_rx) = unbounded();
        self.send(ClientRequest::Op {
            request: Request::counter(key, delta, initial),
            responder: Responder::Counter(resp_tx),
        })?;
        resp_rx.recv().context("counter response channel closed")?
    }

    /// Collects statistics from every node.
    pub fn stats(&self, group: Option<String>) -> Result<Vec<StatEntry>> {
        let (resp_tx, resp_rx) = unbounded();
        self.send(ClientRequest::Op {
            request: Request::stats(group),
            responder: Responder::Stats {
                entries: Vec::new(),
                respond_to: resp_tx,
            },
        })?;
        resp_rx.recv().context("stats response channel closed")?
    }

    /// Stops the worker once its connections are closed. Operations still in
    /// flight are abandoned and their callers see a closed channel.
    pub fn shutdown(&self) -> Result<()> {
        let (resp_tx, resp_rx) = unbounded();
        self.send(ClientRequest::Shutdown {
            respond_to: resp_tx,
        })?;
        resp_rx.recv().context("shutdown acknowledgement channel closed")
    }

    fn send(&self, request: ClientRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .map_err(|_| anyhow!("client worker has stopped"))
    }
}

enum ClientRequest {
    Op {
        request: Request,
        responder: Responder,
    },
    Shutdown {
        respond_to: Sender<()>,
    },
}

/// Where the outcome of one operation goes.
enum Responder {
    Get(Sender<Result<Option<GetResult>>>),
    Cas(Sender<Result<u64>>),
    Remove(Sender<Result<bool>>),
    Counter(Sender<Result<u64>>),
    Stats {
        entries: Vec<StatEntry>,
        respond_to: Sender<Result<Vec<StatEntry>>>,
    },
}

impl Responder {
    fn respond(self, result: Result<Response, OpError>) {
        match self {
            Self::Get(tx) => {
                let reply = match result {
                    Ok(Response::Get { value, flags, cas }) => Ok(Some(GetResult { value, flags, cas })),
                    Err(OpError {
                        kind: ErrorKind::KeyNotFound,
                        ..
                    }) => Ok(None),
                    other => Err(unexpected(other)),
                };
                let _ = tx.send(reply);
            }
            Self::Cas(tx) => {
                let reply = match result {
                    Ok(Response::Store { cas, .. }) => Ok(cas),
                    other => Err(unexpected(other)),
                };
                let _ = tx.send(reply);
            }
            Self::Remove(tx) => {
                let reply = match result {
                    Ok(Response::Remove { .. }) => Ok(true),
                    Err(OpError {
                        kind: ErrorKind::KeyNotFound,
                        ..
                    }) => Ok(false),
                    other => Err(unexpected(other)),
                };
                let _ = tx.send(reply);
            }
            Self::Counter(tx) => {
                let reply = match result {
                    Ok(Response::Counter { value, .. }) => Ok(value),
                    other => Err(unexpected(other)),
                };
                let _ = tx.send(reply);
            }
            Self::Stats {
                entries,
                respond_to,
            } => {
                let reply = match result {
                    Ok(Response::StatsDone { .. }) => Ok(entries),
                    other => Err(unexpected(other)),
                };
                let _ = respond_to.send(reply);
            }
        }
    }

    /// Folds an intermediate streaming entry into the reply.
    fn stream(&mut self, result: Result<Response, OpError>) {
        if let (Self::Stats { entries, .. }, Ok(Response::Stat { server, key, value })) =
            (self, result)
        {
            entries.push(StatEntry { server, key, value });
        }
    }
}

fn unexpected(result: Result<Response, OpError>) -> anyhow::Error {
    match result {
        Err(err) => anyhow::Error::new(err),
        Ok(response) => anyhow!("unexpected response {response:?}"),
    }
}

type Pending = Rc<RefCell<HashMap<Cookie, Responder>>>;

/// Starts a worker thread serving `topology` and returns a handle to it.
pub fn spawn_client(topology: TopologySnapshot, settings: Settings) -> Result<ClientHandle> {
    settings.validate().context("invalid client settings")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build client runtime")?;
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let generation = topology.generation();

    thread::Builder::new()
        .name(format!("kv-client-g{generation}"))
        .spawn(move || {
            let result = runtime.block_on(async move {
                let worker = Worker::new(topology, settings, request_rx);
                worker.run().await
            });
            if let Err(err) = result {
                tracing::error!(error = ?err, "client worker stopped with error");
            }
        })
        .context("failed to spawn client worker")?;

    Ok(ClientHandle { request_tx })
}

struct Worker {
    dispatcher: Dispatcher,
    driver: Driver,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    pending: Pending,
    next_cookie: u64,
}

impl Worker {
    fn new(
        topology: TopologySnapshot,
        settings: Settings,
        requests: mpsc::UnboundedReceiver<ClientRequest>,
    ) -> Self {
        let (driver, io) = Driver::new(&settings);
        let mut dispatcher = Dispatcher::new(
            settings,
            Box::new(io),
            Box::new(StaticConfig::new(topology)),
        );
        let pending: Pending = Rc::default();
        let table = Rc::clone(&pending);
        dispatcher.set_default_callback(Rc::new(move |_: &mut Dispatcher, completion: Completion| {
            complete(&table, completion);
        }));
        Self {
            dispatcher,
            driver,
            requests,
            pending,
            next_cookie: 0,
        }
    }

    async fn run(mut self) -> Result<()> {
        info!("client worker started");
        loop {
            self.driver.flush_if_requested(&mut self.dispatcher);
            select! {
                request = self.requests.recv() => match request {
                    Some(ClientRequest::Op { request, responder }) => self.submit(request, responder),
                    Some(ClientRequest::Shutdown { respond_to }) => {
                        self.shutdown().await?;
                        let _ = respond_to.send(());
                        return Ok(());
                    }
                    None => return self.shutdown().await,
                },
                event = self.driver.next_event() => {
                    let event = event.context("driver event channel closed")?;
                    self.driver.dispatch(&mut self.dispatcher, event);
                }
            }
        }
    }

    fn submit(&mut self, request: Request, responder: Responder) {
        self.next_cookie += 1;
        let cookie = Cookie(self.next_cookie);
        self.pending.borrow_mut().insert(cookie, responder);
        if let Err(err) = self.dispatcher.submit(request, cookie) {
            debug!(cookie = cookie.0, error = %err, "submission rejected");
            if let Some(responder) = self.pending.borrow_mut().remove(&cookie) {
                reject(responder, anyhow::Error::new(err));
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let closed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&closed);
        self.dispatcher.destroy_async(move || flag.set(true));
        self.driver.wait(&mut self.dispatcher).await?;
        let abandoned = self.pending.borrow_mut().drain().count();
        info!(abandoned, closed = closed.get(), "client worker stopped");
        Ok(())
    }
}

fn complete(pending: &Pending, completion: Completion) {
    let mut table = pending.borrow_mut();
    if !completion.is_final {
        if let Some(responder) = table.get_mut(&completion.cookie) {
            responder.stream(completion.result);
        }
        return;
    }
    let Some(responder) = table.remove(&completion.cookie) else {
        return;
    };
    drop(table);
    responder.respond(completion.result);
}

fn reject(responder: Responder, err: anyhow::Error) {
    match responder {
        Responder::Get(tx) => {
            let _ = tx.send(Err(err));
        }
        Responder::Cas(tx) | Responder::Counter(tx) => {
            let _ = tx.send(Err(err));
        }
        Responder::Remove(tx) => {
            let _ = tx.send(Err(err));
        }
        Responder::Stats { respond_to, .. } => {
            let _ = respond_to.send(Err(err));
        }
    }
}
