//! Secure message transport for idnet nodes.
//!
//! - [`OutboundManager`]: seal, persist and deliver with bounded retry
//! - [`InboundPipeline`]: deduplicate, persist, verify, validate, log
//! - [`Transport`] / [`FrameHandler`]: delivery with acknowledgement, over
//!   TCP in production

pub mod backoff;
pub mod clock;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod metrics;
pub mod outbound;
pub mod transport;

pub use backoff::{Backoff, RetryPolicy};
pub use clock::TokioClock;
pub use dedup::DedupTable;
pub use error::{ReceiveError, SendError, TransportError};
pub use frame::{TransportMessage, WireFrame};
pub use inbound::{HandoffError, InboundPipeline, MessageSink, ReceivedMessage, RecoveryStats};
pub use metrics::NetworkMetrics;
pub use outbound::{Delivery, OnDelivered, OutboundConfig, OutboundManager};
pub use transport::{serve, FrameHandler, TcpTransport, Transport};
