//! Client runtime for a partitioned key-value cluster.
//!
//! Commands are encoded into packets, routed to the node that owns their
//! partition, pipelined over one connection per node and matched back to
//! their responses by correlation id. When the cluster map changes under
//! a request, the runtime remaps and retries it within the operation's
//! deadline; every accepted request gets exactly one final callback.
//!
//! - [`dispatch`] holds the [`Dispatcher`](dispatch::Dispatcher), the
//!   single-threaded state machine that owns all routing and recovery.
//! - [`pipeline`] keeps the send queue and in-flight table for one node.
//! - [`partition`] and [`topology`] map keys to partitions and partitions
//!   to nodes; [`retry`] decides what happens to failed packets.
//! - [`protocol`] is the binary frame codec; [`command`] turns typed
//!   commands into frames and responses back into results; [`subdoc`]
//!   encodes the path-addressed document operations.
//! - [`io`] defines the event loop and configuration collaborators;
//!   [`driver`] implements them over tokio sockets.
//! - [`facade`] wraps a dispatcher in a worker thread with a blocking API,
//!   and [`durability`] polls replicas until writes are persisted.
//! - [`testkit`] runs an in-process cluster for tests and `kvd cluster`.

pub mod bench;
pub mod callbacks;
pub mod cli;
pub mod command;
pub mod correlation;
pub mod dispatch;
pub mod driver;
pub mod durability;
pub mod error;
pub mod facade;
pub mod io;
pub mod packet;
pub mod partition;
pub mod pipeline;
pub mod protocol;
pub mod retry;
pub mod sched;
pub mod settings;
pub mod subdoc;
pub mod testkit;
pub mod topology;
