//! Selector-pool based message I/O: a fixed pool of epoll event-loop
//! threads drives non-blocking TCP, TLS, and UDP channels, each framing its
//! byte stream with a pluggable [`codec::Codec`] and exposing decoded
//! messages through a backpressure-aware [`buffer::MessageBuffer`].
//!
//! ```no_run
//! use switchyard_io::channel::tcp;
//! use switchyard_io::config::ChannelBuilder;
//! use switchyard_io::pool::SelectorPool;
//!
//! let pool = SelectorPool::open("switchyard", 4).unwrap();
//! let config = ChannelBuilder::new(pool).message_length(65535).build();
//! let handle = tcp::connect(&config, "127.0.0.1:9000").unwrap();
//! handle.connect_future().wait().unwrap();
//! ```

mod sys;

pub mod epoll;
pub use epoll::{Epoll, EpollOpt, Events, Ready, SelectorId, Source, Token};

pub mod net;

pub mod buffer;
pub mod codec;
pub mod ratelimit;

pub mod error;
pub use error::{Error, Result};

pub mod future;
pub mod waker;

pub mod pool;
pub mod processor;

pub mod config;
pub mod channel;
pub mod acceptor;
