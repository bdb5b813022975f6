//! Tokio event loop for a [`Dispatcher`].
//!
//! Each node connection runs as its own task that moves bytes between the
//! socket and two channels. Everything those tasks observe comes back to the
//! loop as an [`IoEvent`], and the loop feeds it to the dispatcher on the
//! thread that owns it. Timers are kept in a map and serviced by sleeping
//! until the earliest one.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, timeout},
};
use tracing::{debug, trace, warn};

use crate::{
    dispatch::Dispatcher,
    error::ErrorKind,
    io::{IoHandler, TimerId},
    pipeline::NodeId,
    settings::Settings,
};

const READ_CHUNK: usize = 16 * 1024;

/// What a connection task reports back to the loop.
#[derive(Debug)]
pub enum IoEvent {
    Connected { node: NodeId, epoch: u64 },
    ConnectFailed { node: NodeId, epoch: u64, reason: String },
    Data { node: NodeId, epoch: u64, bytes: Bytes },
    SocketError { node: NodeId, epoch: u64, reason: String },
    /// The connection was torn down on request.
    Closed { node: NodeId },
}

#[derive(Debug)]
pub enum Event {
    Io(IoEvent),
    Timer(TimerId),
}

struct Conn {
    epoch: u64,
    write_tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

struct IoState {
    events_tx: mpsc::UnboundedSender<IoEvent>,
    conns: HashMap<NodeId, Conn>,
    timers: HashMap<TimerId, Instant>,
    flush_requested: bool,
    connect_timeout: Duration,
    next_epoch: u64,
}

/// [`IoHandler`] backed by tokio sockets and the [`Driver`] timer map.
#[derive(Clone)]
pub struct TokioIo {
    state: Rc<RefCell<IoState>>,
}

impl TokioIo {
    fn next_timer(&self) -> Option<(TimerId, Instant)> {
        self.state
            .borrow()
            .timers
            .iter()
            .min_by_key(|(id, at)| (**at, **id))
            .map(|(id, at)| (*id, *at))
    }

    fn take_timer(&self, id: TimerId, at: Instant) -> bool {
        let mut state = self.state.borrow_mut();
        if state.timers.get(&id) == Some(&at) {
            state.timers.remove(&id);
            return true;
        }
        false
    }

    fn take_flush_request(&self) -> bool {
        std::mem::take(&mut self.state.borrow_mut().flush_requested)
    }

    /// Whether `epoch` is the live connection for `node`.
    fn is_current(&self, node: NodeId, epoch: u64) -> bool {
        self.state
            .borrow()
            .conns
            .get(&node)
            .is_some_and(|conn| conn.epoch == epoch)
    }

    fn forget(&self, node: NodeId) {
        if let Some(conn) = self.state.borrow_mut().conns.remove(&node) {
            conn.task.abort();
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state.borrow().conns.len()
    }
}

impl IoHandler for TokioIo {
    fn connect(&mut self, node: NodeId, addr: &str) {
        let mut state = self.state.borrow_mut();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            node,
            epoch,
            addr.to_string(),
            state.connect_timeout,
            write_rx,
            state.events_tx.clone(),
        ));
        if let Some(previous) = state.conns.insert(
            node,
            Conn {
                epoch,
                write_tx,
                task,
            },
        ) {
            previous.task.abort();
        }
    }

    fn schedule_write(&mut self, node: NodeId, bytes: Bytes) -> bool {
        match self.state.borrow().conns.get(&node) {
            Some(conn) => conn.write_tx.send(bytes).is_ok(),
            None => false,
        }
    }

    fn close(&mut self, node: NodeId) {
        let mut state = self.state.borrow_mut();
        if let Some(conn) = state.conns.remove(&node) {
            conn.task.abort();
        }
        if state.events_tx.send(IoEvent::Closed { node }).is_err() {
            debug!(node = %node, "event loop gone, close not reported");
        }
    }

    fn arm_timer(&mut self, id: TimerId, deadline: Instant) {
        self.state.borrow_mut().timers.insert(id, deadline);
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.state.borrow_mut().timers.remove(&id);
    }

    fn request_flush(&mut self) {
        self.state.borrow_mut().flush_requested = true;
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

async fn run_connection(
    node: NodeId,
    epoch: u64,
    addr: String,
    connect_timeout: Duration,
    write_rx: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<IoEvent>,
) {
    let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let _ = events.send(IoEvent::ConnectFailed {
                node,
                epoch,
                reason: err.to_string(),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(IoEvent::ConnectFailed {
                node,
                epoch,
                reason: format!("no connection after {connect_timeout:?}"),
            });
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!(node = %node, error = ?err, "failed to set TCP_NODELAY");
    }
    if events.send(IoEvent::Connected { node, epoch }).is_err() {
        return;
    }
    if let Err(err) = pump(node, epoch, stream, write_rx, &events).await {
        let _ = events.send(IoEvent::SocketError {
            node,
            epoch,
            reason: format!("{err:#}"),
        });
    }
}

/// Moves bytes both ways until the socket fails or the write side is dropped.
async fn pump(
    node: NodeId,
    epoch: u64,
    stream: TcpStream,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
    events: &mpsc::UnboundedSender<IoEvent>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        select! {
            outgoing = write_rx.recv() => {
                let Some(bytes) = outgoing else {
                    return Ok(());
                };
                writer.write_all(&bytes).await.context("write failed")?;
            }
            read = reader.read_buf(&mut buf) => {
                let n = read.context("read failed")?;
                if n == 0 {
                    anyhow::bail!("connection closed by peer");
                }
                trace!(node = %node, len = n, "read");
                let bytes = buf.split().freeze();
                buf.reserve(READ_CHUNK);
                if events.send(IoEvent::Data { node, epoch, bytes }).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Owns the event channel and runs the loop for one dispatcher.
pub struct Driver {
    io: TokioIo,
    events_rx: mpsc::UnboundedReceiver<IoEvent>,
}

impl Driver {
    /// Creates a driver and the handler to give to [`Dispatcher::new`].
    pub fn new(settings: &Settings) -> (Self, TokioIo) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let io = TokioIo {
            state: Rc::new(RefCell::new(IoState {
                events_tx,
                conns: HashMap::new(),
                timers: HashMap::new(),
                flush_requested: false,
                connect_timeout: settings.connect_timeout,
                next_epoch: 0,
            })),
        };
        (
            Self {
                io: io.clone(),
                events_rx,
            },
            io,
        )
    }

    pub fn io(&self) -> &TokioIo {
        &self.io
    }

    /// Waits for the next socket event or timer expiry.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            let next_timer = self.io.next_timer();
            let sleep = async {
                match next_timer {
                    Some((_, at)) => sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            select! {
                biased;
                event = self.events_rx.recv() => return event.map(Event::Io),
                _ = sleep => {
                    if let Some((id, at)) = next_timer {
                        if self.io.take_timer(id, at) {
                            return Some(Event::Timer(id));
                        }
                    }
                }
            }
        }
    }

    /// Feeds one event to `dispatcher`, dropping reports from replaced connections.
    pub fn dispatch(&self, dispatcher: &mut Dispatcher, event: Event) {
        match event {
            Event::Timer(id) => dispatcher.on_timer(id),
            Event::Io(IoEvent::Closed { node }) => dispatcher.on_closed(node),
            Event::Io(IoEvent::Connected { node, epoch }) => {
                if self.io.is_current(node, epoch) {
                    dispatcher.on_connected(node);
                }
            }
            Event::Io(IoEvent::ConnectFailed {
                node,
                epoch,
                reason,
            }) => {
                if self.io.is_current(node, epoch) {
                    warn!(node = %node, reason = %reason, "connect failed");
                    self.io.forget(node);
                    dispatcher.on_connect_failed(node);
                }
            }
            Event::Io(IoEvent::Data { node, epoch, bytes }) => {
                if self.io.is_current(node, epoch) {
                    dispatcher.on_readable(node, &bytes);
                }
            }
            Event::Io(IoEvent::SocketError {
                node,
                epoch,
                reason,
            }) => {
                if self.io.is_current(node, epoch) {
                    warn!(node = %node, reason = %reason, "connection lost");
                    dispatcher.on_socket_error(node, ErrorKind::Network);
                }
            }
        }
    }

    /// Runs the flush pass the dispatcher asked for, if any.
    pub fn flush_if_requested(&self, dispatcher: &mut Dispatcher) {
        if self.io.take_flush_request() {
            dispatcher.flush_dirty();
        }
    }

    /// Runs the loop until nothing is pending or a callback requests a breakout.
    pub async fn wait(&mut self, dispatcher: &mut Dispatcher) -> Result<()> {
        let breakout = dispatcher.breakout();
        loop {
            self.flush_if_requested(dispatcher);
            if breakout.take() || !dispatcher.has_pending() {
                return Ok(());
            }
            let event = self
                .next_event()
                .await
                .context("event channel closed while operations were pending")?;
            self.dispatch(dispatcher, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn earliest_timer_fires_first_and_cancelled_ones_never() {
        let (mut driver, mut io) = Driver::new(&Settings::default());
        let now = io.now();
        io.arm_timer(TimerId::Retry, now + Duration::from_millis(50));
        io.arm_timer(TimerId::Durability(1), now + Duration::from_millis(10));
        io.arm_timer(TimerId::Durability(2), now + Duration::from_millis(5));
        io.cancel_timer(TimerId::Durability(2));

        let first = driver.next_event().await;
        assert!(matches!(first, Some(Event::Timer(TimerId::Durability(1)))));
        let second = driver.next_event().await;
        assert!(matches!(second, Some(Event::Timer(TimerId::Retry))));
    }

    #[tokio::test]
    async fn close_reports_closed_event() {
        let (mut driver, mut io) = Driver::new(&Settings::default());
        io.close(NodeId(4));
        let event = driver.next_event().await;
        assert!(matches!(event, Some(Event::Io(IoEvent::Closed { node: NodeId(4) }))));
    }

    #[tokio::test]
    async fn flush_requests_coalesce() {
        let (driver, mut io) = Driver::new(&Settings::default());
        io.request_flush();
        io.request_flush();
        assert!(driver.io().take_flush_request());
        assert!(!driver.io().take_flush_request());
    }
}
