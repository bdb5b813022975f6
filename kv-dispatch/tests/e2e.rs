//! Dispatcher and tokio driver against the in-process test cluster.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use kv_dispatch::callbacks::{Completion, Cookie};
use kv_dispatch::command::{Request, Response};
use kv_dispatch::dispatch::Dispatcher;
use kv_dispatch::driver::Driver;
use kv_dispatch::durability::DurabilityOptions;
use kv_dispatch::error::{ErrorKind, OpError};
use kv_dispatch::io::StaticConfig;
use kv_dispatch::partition;
use kv_dispatch::settings::Settings;
use kv_dispatch::testkit::TestCluster;
use kv_dispatch::topology::{NodeInfo, TopologySnapshot};

/// One dispatcher plus its driver, collecting every completion.
struct Client {
    dispatcher: Dispatcher,
    driver: Driver,
    done: Rc<RefCell<Vec<Completion>>>,
}

impl Client {
    fn new(topology: TopologySnapshot, settings: Settings) -> Self {
        let (driver, io) = Driver::new(&settings);
        let mut dispatcher =
            Dispatcher::new(settings, Box::new(io), Box::new(StaticConfig::new(topology)));
        let done = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&done);
        dispatcher.set_default_callback(Rc::new(move |_: &mut Dispatcher, completion: Completion| {
            sink.borrow_mut().push(completion);
        }));
        Self {
            dispatcher,
            driver,
            done,
        }
    }

    /// Submits `request` and runs the loop until everything settles.
    async fn call_all(&mut self, request: Request) -> Result<Vec<Completion>> {
        self.dispatcher.submit(request, Cookie(1))?;
        self.driver.wait(&mut self.dispatcher).await?;
        Ok(std::mem::take(&mut *self.done.borrow_mut()))
    }

    async fn call(&mut self, request: Request) -> Result<Completion> {
        let mut completions = self.call_all(request).await?;
        anyhow::ensure!(completions.len() == 1, "expected one completion, got {completions:?}");
        completions.pop().context("no completion")
    }
}

fn kind(completion: &Completion) -> Option<ErrorKind> {
    completion.result.as_ref().err().map(|err| err.kind)
}

#[tokio::test]
async fn mutations_and_reads_round_trip() -> Result<()> {
    let cluster = TestCluster::start(3, 16, 1).await?;
    let mut client = Client::new(cluster.topology().await, Settings::default());

    let stored = client.call(Request::upsert("alpha", "one")).await?;
    let token = stored.result.as_ref().ok().and_then(Response::token);
    assert!(token.is_some());

    let read = client.call(Request::get("alpha")).await?;
    match read.result {
        Ok(Response::Get { value, .. }) => assert_eq!(value, Bytes::from_static(b"one")),
        other => panic!("unexpected {other:?}"),
    }

    let first = client.call(Request::counter("hits", 5, Some(10))).await?;
    assert!(matches!(first.result, Ok(Response::Counter { value: 10, .. })));
    let second = client.call(Request::counter("hits", 5, None)).await?;
    assert!(matches!(second.result, Ok(Response::Counter { value: 15, .. })));

    let removed = client.call(Request::remove("alpha")).await?;
    assert!(removed.result.is_ok());
    let missing = client.call(Request::get("alpha")).await?;
    assert_eq!(
        missing.result,
        Err(OpError {
            kind: ErrorKind::KeyNotFound,
            retries: 0,
        })
    );

    cluster.shutdown().await
}

#[tokio::test]
async fn moved_partition_is_followed_through_the_returned_map() -> Result<()> {
    let cluster = TestCluster::start(3, 16, 0).await?;
    let topology = cluster.topology().await;
    let located = partition::locate(b"wanderer", &topology)?;
    let mut client = Client::new(topology, Settings::default());
    client.call(Request::upsert("wanderer", "v")).await?;

    cluster
        .move_partition(located.partition, (located.node + 1) % 3)
        .await?;
    let read = client.call(Request::get("wanderer")).await?;
    assert!(read.result.is_ok());
    assert_eq!(read.retries, 1);
    assert_eq!(client.dispatcher.topology().map(|t| t.generation()), Some(2));
    assert_eq!(client.dispatcher.stats().remaps, 1);

    cluster.shutdown().await
}

#[tokio::test]
async fn owner_is_guessed_when_replies_carry_no_map() -> Result<()> {
    let cluster = TestCluster::start(3, 16, 0).await?;
    let topology = cluster.topology().await;
    let located = partition::locate(b"hidden", &topology)?;
    let mut client = Client::new(topology, Settings::default());
    client.call(Request::upsert("hidden", "v")).await?;

    cluster.set_nmv_carries_map(false).await;
    cluster
        .move_partition(located.partition, (located.node + 2) % 3)
        .await?;
    let read = client.call(Request::get("hidden")).await?;
    assert!(read.result.is_ok());
    assert_eq!(read.retries, 2);
    assert_eq!(client.dispatcher.topology().map(|t| t.generation()), Some(1));

    cluster.shutdown().await
}

#[tokio::test]
async fn silent_node_times_out_after_operation_timeout() -> Result<()> {
    let cluster = TestCluster::start(2, 8, 0).await?;
    let topology = cluster.topology().await;
    let located = partition::locate(b"void", &topology)?;
    let settings = Settings {
        operation_timeout: Duration::from_millis(200),
        ..Settings::default()
    };
    let mut client = Client::new(topology, settings);
    cluster.black_hole(located.node, true).await;

    let started = Instant::now();
    let read = client.call(Request::get("void")).await?;
    assert_eq!(kind(&read), Some(ErrorKind::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.dispatcher.stats().timeouts, 1);

    cluster.black_hole(located.node, false).await;
    let again = client.call(Request::upsert("void", "back")).await?;
    assert!(again.result.is_ok());

    cluster.shutdown().await
}

#[tokio::test]
async fn stats_stream_from_every_node() -> Result<()> {
    let cluster = TestCluster::start(3, 16, 0).await?;
    let mut client = Client::new(cluster.topology().await, Settings::default());

    let completions = client.call_all(Request::stats(None)).await?;
    assert_eq!(completions.len(), 10);
    let (finals, entries): (Vec<_>, Vec<_>) = completions.into_iter().partition(|c| c.is_final);
    assert_eq!(finals.len(), 1);
    assert!(matches!(finals[0].result, Ok(Response::StatsDone { .. })));
    let indexes = entries
        .iter()
        .filter_map(|c| match &c.result {
            Ok(Response::Stat { key, value, .. }) if key == "node_index" => Some(value.clone()),
            _ => None,
        })
        .collect::<std::collections::BTreeSet<_>>();
    assert_eq!(indexes.len(), 3);

    cluster.shutdown().await
}

#[tokio::test]
async fn endure_completes_once_replicas_report() -> Result<()> {
    let cluster = TestCluster::start(2, 8, 1).await?;
    let mut client = Client::new(cluster.topology().await, Settings::default());

    let stored = client.call(Request::upsert("durable", "v")).await?;
    let token = stored
        .result
        .as_ref()
        .ok()
        .and_then(Response::token)
        .context("store returned no token")?;

    client.dispatcher.endure(
        vec![(Bytes::from_static(b"durable"), token)],
        DurabilityOptions::new(2, 1),
        Cookie(5),
    )?;
    client.driver.wait(&mut client.dispatcher).await?;
    let completions = std::mem::take(&mut *client.done.borrow_mut());
    assert_eq!(completions.len(), 1);
    match &completions[0].result {
        Ok(Response::Endure(report)) => {
            assert_eq!(report.token, token);
            assert_eq!(report.persisted, 2);
            assert_eq!(report.replicated, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn refused_connection_fails_writes_and_times_out_reads() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let topology = TopologySnapshot::uniform(
        1,
        vec![NodeInfo::new(addr.ip().to_string(), addr.port())],
        4,
        0,
    )?;
    let settings = Settings {
        operation_timeout: Duration::from_millis(300),
        ..Settings::default()
    };
    let mut client = Client::new(topology, settings);

    let write = client.call(Request::upsert("nowhere", "v")).await?;
    assert_eq!(kind(&write), Some(ErrorKind::ConnectFailed));
    assert_eq!(write.retries, 0);

    let read = client.call(Request::get("nowhere")).await?;
    assert_eq!(kind(&read), Some(ErrorKind::ConnectFailed));
    assert!(read.retries > 0);
    Ok(())
}

#[tokio::test]
async fn destroy_async_waits_for_open_connections() -> Result<()> {
    let cluster = TestCluster::start(2, 8, 0).await?;
    let mut client = Client::new(cluster.topology().await, Settings::default());
    client.call(Request::upsert("a", "1")).await?;
    client.call(Request::upsert("b", "2")).await?;

    let closed = Rc::new(Cell::new(false));
    let flag = Rc::clone(&closed);
    client.dispatcher.destroy_async(move || flag.set(true));
    client.driver.wait(&mut client.dispatcher).await?;
    assert!(closed.get());
    assert_eq!(client.driver.io().open_connections(), 0);
    assert!(client.done.borrow().is_empty());

    cluster.shutdown().await
}
