pub mod dedup;
pub mod events;
pub mod outbound;
pub mod runner;
pub mod transport;
pub mod ws;

pub use dedup::DedupCache;
pub use events::{GatewayEvent, HandlerError, InboundMessage, MessageHandler, OutboundSender};
pub use runner::GatewayRunner;
pub use transport::{ChatTransport, NoopTransport, ReconnectPolicy, TransportError};
pub use ws::WsTransport;
