pub mod attachment;
pub mod channel;
pub mod controlvm;
pub mod diag;
pub mod errors;
pub mod guid;
pub mod header;
pub mod paths;
pub mod region;
pub mod retry;
#[cfg(feature = "semaphores")]
pub mod semaphore;
pub mod signal_queue;

pub use attachment::{ClientAttachment, ClientState, ServerState, can_transition};
pub use channel::{Channel, ChannelState, Role};
pub use diag::{DiagnosticSink, PostCode, RecordingDiagnostics, Severity, TracingDiagnostics};
pub use errors::ChannelError;
pub use guid::Guid;
pub use header::{ChannelExpectation, ChannelHeader, ValidationError};
pub use region::{ChannelLocator, FileChannelLocator, FileRegionMapper, RegionMapper, SharedRegion};
pub use retry::RetryConfig;
#[cfg(feature = "semaphores")]
pub use semaphore::Doorbell;
pub use signal_queue::{QueueStats, SignalQueue, SignalQueueHeader};
