//! Database-side client for the external index build protocol.
//!
//! A [`BuildSession`] streams vectors to an indexing server over a blocking
//! [`Transport`] and receives the built index in return:
//!
//! ```ignore
//! let config = ClientConfig::from_env()?;
//! let params = BuildParams::new(128, MetricKind::L2sq).with_m(10);
//! let session = BuildSession::new(config, Arc::new(FailurePoints::new()));
//! let outcome = session.run(&params, rows, &mut |header, body| catalog.store(header, body))?;
//! ```
//!
//! Every blocking call is bounded by a timeout from [`ClientConfig`]. A
//! failure at any step aborts the session; nothing is handed to the
//! [`IndexSink`] unless the whole index arrived intact.

pub mod config;
pub mod session;
mod tls;
pub mod transport;

pub use config::{BuildParams, ClientConfig, ConfigError};
pub use session::{BuildOutcome, BuildSession, IndexSink, SessionState};
pub use transport::Transport;
