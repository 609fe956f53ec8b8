//! ControlVM: the bus/device/chipset lifecycle protocol carried on four
//! signal queues of one channel.

pub mod channel;
pub mod dispatch;
pub mod message;
pub mod payload;
pub mod status;
pub mod wire;

pub use channel::{
    CONTROLVM_CHANNEL_TYPE, CONTROLVM_CHANNEL_VERSION, CONTROLVM_CRASHMSG_MAX, CRASH_POOL_OFFSET,
    ControlVmChannel, ControlVmLayout, ControlVmQueue, CrashSlot, PayloadRef,
};
pub use dispatch::{
    BusSpec, ChipsetHandler, DeviceSpec, Dispatch, DispatchStats, Dispatcher, Outcome,
    PayloadSource, Request,
};
pub use message::{
    ChipsetFeatures, ControlVmCommand, ControlVmId, ControlVmMessage, IrqInfo, MessageError,
    MessageFlags, MessageHeader, RawHeader, SegmentState,
};
pub use payload::{ControlVmPayload, PayloadError};
pub use status::CompletionStatus;
pub use wire::{MESSAGE_SIZE, RawMessage};
