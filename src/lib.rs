//! A length-prefix-agnostic streaming TCP client framework for connecting
//! to exchange and broker gateways: a per-connection `StreamClient` (socket
//! + double-buffered read loop + send paths) and a per-endpoint
//! `StreamClientService` (reactor, worker threads, reconnect state
//! machine). Framing is delegated entirely to an application-supplied
//! `Decoder`; this crate owns none of the wire format.

#[macro_use]
extern crate log;
extern crate bytes;
extern crate futures;
extern crate rustls;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate serde_yaml;
extern crate tokio_core;
extern crate tokio_io;
extern crate tokio_timer;

pub mod buffer;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod hexdump;
pub mod measurement;
pub mod service;
pub mod throttle;
pub mod transport;
pub mod ws;

pub use client::{ClientDestroySink, DisconnectSink, LogTag, StreamClient};
pub use config::{EndpointConfig, ResolvedConfig};
pub use decoder::{Decoder as MessageDecoder, ProtocolSignal};
pub use error::{ClientError, ServiceError};
pub use service::{ServiceHooks, StreamClientService};
