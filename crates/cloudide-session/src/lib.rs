//! Real-time transport for a workspace client: one multiplexed workspace
//! connection per mounted session, debounced document write-back, and
//! terminal connections bound to the workspace's shell pod.

pub mod bus;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod terminal;

pub use bus::{Callback, EventBus, Subscription};
pub use config::ClientConfig;
pub use connection::{CloseReason, Connection, ConnectionState, Inbound, InboundStream};
pub use debounce::{Debouncer, MutationSink};
pub use dispatch::{Dispatcher, ReplyMatching, TimeoutPolicy};
pub use error::{ConfigError, RequestError, TransportError};
pub use session::{DocumentWriter, Session, SessionState};
pub use terminal::{
    TerminalHandle, TerminalSession, TerminalSize, TerminalState, TerminalSurface, ViewportFit,
    Vt100Surface,
};
