//! Moving persisted batches to remote endpoints.

pub mod backoff;
pub mod encoder;
pub mod transport;
pub mod worker;

pub use backoff::{classify_status, Classification, RetryPolicy, MAX_BACKOFF};
pub use encoder::{EncodeError, JsonEncoder, WireEncoder};
pub use transport::{HttpTransport, SendResponse, Transport, TransportError, WriteRequest};
pub use worker::{BatchOutcome, DeliveryWorker, DropCause, WorkerDeps};
