//! Reactor-pattern non-blocking TCP networking.
//!
//! A `tidepool` process runs one event loop per I/O thread. Each loop polls a
//! readiness demultiplexer (epoll by default, poll(2) as a fallback), drives a
//! timerfd-backed timer queue, and dispatches readiness to per-fd channels.
//! `TcpServer` and `TcpClient` compose the pieces into loop-per-thread TCP
//! services; all per-loop state is mutated only on the loop's owning thread,
//! and cross-thread calls marshal through `LoopHandle`.
//!
//! Linux-only: eventfd, timerfd, and epoll are load-bearing.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod poller;
pub mod pool;
pub mod server;
pub(crate) mod socket;
pub mod timer;

// Public API re-exports
pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use client::TcpClient;
pub use config::Config;
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback, default_connection_callback,
    default_message_callback,
};
pub use connector::Connector;
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::TcpServer;
pub use timer::TimerId;
