use super::status::CompletionStatus;
use super::wire::{
    BusChangeStateWire, BusConfigureWire, BusCreateWire, BusDestroyWire, ChipsetInitWire,
    ChipsetSelftestWire, DeviceAddressWire, DeviceChangeStateEventWire, DeviceChangeStateWire,
    DeviceCreateWire, IrqInfoWire, MESSAGE_HEADER_SIZE, MESSAGE_SIZE, MessageHeaderWire,
    MessageWire, PACKET_SIZE, RawMessage,
};
use crate::guid::Guid;
use bitflags::bitflags;
use std::mem::size_of;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlVmId {
    BusCreate = 0x101,
    BusDestroy = 0x102,
    BusConfigure = 0x104,
    BusChangeState = 0x105,
    BusChangeStateEvent = 0x106,
    DeviceCreate = 0x201,
    DeviceDestroy = 0x202,
    DeviceConfigure = 0x203,
    DeviceChangeState = 0x204,
    DeviceChangeStateEvent = 0x205,
    DeviceReconfigure = 0x206,
    ChipsetInit = 0x301,
    ChipsetStop = 0x302,
    ChipsetReady = 0x304,
    ChipsetSelftest = 0x305,
}

impl ControlVmId {
    pub const ALL: [ControlVmId; 15] = [
        ControlVmId::BusCreate,
        ControlVmId::BusDestroy,
        ControlVmId::BusConfigure,
        ControlVmId::BusChangeState,
        ControlVmId::BusChangeStateEvent,
        ControlVmId::DeviceCreate,
        ControlVmId::DeviceDestroy,
        ControlVmId::DeviceConfigure,
        ControlVmId::DeviceChangeState,
        ControlVmId::DeviceChangeStateEvent,
        ControlVmId::DeviceReconfigure,
        ControlVmId::ChipsetInit,
        ControlVmId::ChipsetStop,
        ControlVmId::ChipsetReady,
        ControlVmId::ChipsetSelftest,
    ];

    /// Bytes of the packet union this id actually uses.
    pub const fn packet_size(self) -> usize {
        match self {
            ControlVmId::BusCreate => size_of::<BusCreateWire>(),
            ControlVmId::BusDestroy => size_of::<BusDestroyWire>(),
            ControlVmId::BusConfigure => size_of::<BusConfigureWire>(),
            ControlVmId::BusChangeState | ControlVmId::BusChangeStateEvent => {
                size_of::<BusChangeStateWire>()
            }
            ControlVmId::DeviceCreate => size_of::<DeviceCreateWire>(),
            ControlVmId::DeviceDestroy
            | ControlVmId::DeviceConfigure
            | ControlVmId::DeviceReconfigure => size_of::<DeviceAddressWire>(),
            ControlVmId::DeviceChangeState => size_of::<DeviceChangeStateWire>(),
            ControlVmId::DeviceChangeStateEvent => size_of::<DeviceChangeStateEventWire>(),
            ControlVmId::ChipsetInit => size_of::<ChipsetInitWire>(),
            ControlVmId::ChipsetStop | ControlVmId::ChipsetReady => 0,
            ControlVmId::ChipsetSelftest => size_of::<ChipsetSelftestWire>(),
        }
    }

    /// Whether `message_size` is acceptable for this id: either a full slot
    /// or exactly header plus this id's packet.
    pub fn accepts_size(self, message_size: u32) -> bool {
        let size = message_size as usize;
        size == MESSAGE_SIZE || size == MESSAGE_HEADER_SIZE + self.packet_size()
    }

    pub fn is_event(self) -> bool {
        matches!(
            self,
            ControlVmId::BusChangeStateEvent | ControlVmId::DeviceChangeStateEvent
        )
    }
}

impl TryFrom<u32> for ControlVmId {
    type Error = MessageError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ControlVmId::ALL
            .into_iter()
            .find(|id| *id as u32 == value)
            .ok_or(MessageError::UnknownId(value))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        const FAILED = 1 << 0;
        const RESPONSE_EXPECTED = 1 << 1;
        /// Receiver acts as the bus or device server.
        const SERVER = 1 << 2;
        const TEST_MESSAGE = 1 << 3;
        /// More responses for this handle follow.
        const PARTIAL_COMPLETION = 1 << 4;
        /// Do not clear channel content as a side effect.
        const PRESERVE = 1 << 5;
        const WRITER_IN_DIAG = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SegmentState: u16 {
        const ENABLED = 1 << 0;
        const ACTIVE = 1 << 1;
        const ALIVE = 1 << 2;
        const REVOKED = 1 << 3;
        const ALLOCATED = 1 << 4;
        const KNOWN = 1 << 5;
        const READY = 1 << 6;
        const OPERATING = 1 << 7;
    }
}

impl SegmentState {
    pub const RUNNING: Self = Self::from_bits_retain(0b1111_0111);
    pub const PAUSED: Self = Self::from_bits_retain(0b0111_0111);
    pub const STANDBY: Self = Self::from_bits_retain(0b0111_0011);

    pub fn is_running(self) -> bool {
        self == Self::RUNNING
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChipsetFeatures: u32 {
        const REPLY = 1 << 0;
        const PARA_HOTPLUG = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqInfo {
    pub recv_irq_handle: u64,
    pub recv_irq_vector: u32,
    pub recv_irq_shared: bool,
}

impl From<&IrqInfoWire> for IrqInfo {
    fn from(w: &IrqInfoWire) -> Self {
        Self {
            recv_irq_handle: w.recv_irq_handle.get(),
            recv_irq_vector: w.recv_irq_vector.get(),
            recv_irq_shared: w.recv_irq_shared != 0,
        }
    }
}

impl From<&IrqInfo> for IrqInfoWire {
    fn from(i: &IrqInfo) -> Self {
        Self {
            reserved1: 0.into(),
            recv_irq_handle: i.recv_irq_handle.into(),
            recv_irq_vector: i.recv_irq_vector.into(),
            recv_irq_shared: i.recv_irq_shared as u8,
            reserved: [0; 3],
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message id {0:#x}")]
    UnknownId(u32),

    #[error("{id:?} declares message_size {actual}, expected {expected} or {full}", full = MESSAGE_SIZE)]
    SizeMismatch {
        id: ControlVmId,
        expected: u32,
        actual: u32,
    },

    #[error("buffer of {0} bytes cannot hold a message")]
    Truncated(usize),
}

impl MessageError {
    /// Status to answer a rejected request with.
    pub fn status(&self) -> CompletionStatus {
        match self {
            MessageError::UnknownId(_) => CompletionStatus::ID_UNKNOWN,
            MessageError::SizeMismatch { .. } | MessageError::Truncated(_) => {
                CompletionStatus::PAYLOAD_INVALID
            }
        }
    }
}

/// The command-specific half of a message, keyed by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVmCommand {
    BusCreate {
        bus_no: u32,
        dev_count: u32,
        channel_addr: u64,
        channel_bytes: u64,
        bus_data_type: Guid,
        bus_instance: Guid,
    },
    BusDestroy {
        bus_no: u32,
    },
    BusConfigure {
        bus_no: u32,
        guest_handle: u64,
        recv_bus_irq_handle: u64,
    },
    BusChangeState {
        bus_no: u32,
        state: SegmentState,
    },
    BusChangeStateEvent {
        bus_no: u32,
        state: SegmentState,
    },
    DeviceCreate {
        bus_no: u32,
        dev_no: u32,
        channel_addr: u64,
        channel_bytes: u64,
        data_type: Guid,
        dev_instance: Guid,
        intr: IrqInfo,
    },
    DeviceDestroy {
        bus_no: u32,
        dev_no: u32,
    },
    DeviceConfigure {
        bus_no: u32,
        dev_no: u32,
    },
    DeviceReconfigure {
        bus_no: u32,
        dev_no: u32,
    },
    DeviceChangeState {
        bus_no: u32,
        dev_no: u32,
        state: SegmentState,
        phys_device: bool,
    },
    DeviceChangeStateEvent {
        bus_no: u32,
        dev_no: u32,
        state: SegmentState,
    },
    ChipsetInit {
        bus_count: u32,
        switch_count: u32,
        features: ChipsetFeatures,
        platform_number: u32,
    },
    ChipsetStop,
    ChipsetReady,
    ChipsetSelftest {
        options: u32,
        test: u32,
    },
}

fn read_packet<T: FromBytes>(packet: &[u8; PACKET_SIZE]) -> Result<T, MessageError> {
    T::read_from_prefix(&packet[..])
        .map(|(value, _)| value)
        .map_err(|_| MessageError::Truncated(PACKET_SIZE))
}

fn write_packet<T: IntoBytes + Immutable>(packet: &mut [u8; PACKET_SIZE], value: &T) {
    let bytes = value.as_bytes();
    packet[..bytes.len()].copy_from_slice(bytes);
}

impl ControlVmCommand {
    pub fn id(&self) -> ControlVmId {
        match self {
            ControlVmCommand::BusCreate { .. } => ControlVmId::BusCreate,
            ControlVmCommand::BusDestroy { .. } => ControlVmId::BusDestroy,
            ControlVmCommand::BusConfigure { .. } => ControlVmId::BusConfigure,
            ControlVmCommand::BusChangeState { .. } => ControlVmId::BusChangeState,
            ControlVmCommand::BusChangeStateEvent { .. } => ControlVmId::BusChangeStateEvent,
            ControlVmCommand::DeviceCreate { .. } => ControlVmId::DeviceCreate,
            ControlVmCommand::DeviceDestroy { .. } => ControlVmId::DeviceDestroy,
            ControlVmCommand::DeviceConfigure { .. } => ControlVmId::DeviceConfigure,
            ControlVmCommand::DeviceReconfigure { .. } => ControlVmId::DeviceReconfigure,
            ControlVmCommand::DeviceChangeState { .. } => ControlVmId::DeviceChangeState,
            ControlVmCommand::DeviceChangeStateEvent { .. } => ControlVmId::DeviceChangeStateEvent,
            ControlVmCommand::ChipsetInit { .. } => ControlVmId::ChipsetInit,
            ControlVmCommand::ChipsetStop => ControlVmId::ChipsetStop,
            ControlVmCommand::ChipsetReady => ControlVmId::ChipsetReady,
            ControlVmCommand::ChipsetSelftest { .. } => ControlVmId::ChipsetSelftest,
        }
    }

    /// Bus and device numbers this command addresses, if any.
    pub fn target(&self) -> (Option<u32>, Option<u32>) {
        match *self {
            ControlVmCommand::BusCreate { bus_no, .. }
            | ControlVmCommand::BusDestroy { bus_no }
            | ControlVmCommand::BusConfigure { bus_no, .. }
            | ControlVmCommand::BusChangeState { bus_no, .. }
            | ControlVmCommand::BusChangeStateEvent { bus_no, .. } => (Some(bus_no), None),
            ControlVmCommand::DeviceCreate { bus_no, dev_no, .. }
            | ControlVmCommand::DeviceDestroy { bus_no, dev_no }
            | ControlVmCommand::DeviceConfigure { bus_no, dev_no }
            | ControlVmCommand::DeviceReconfigure { bus_no, dev_no }
            | ControlVmCommand::DeviceChangeState { bus_no, dev_no, .. }
            | ControlVmCommand::DeviceChangeStateEvent { bus_no, dev_no, .. } => {
                (Some(bus_no), Some(dev_no))
            }
            _ => (None, None),
        }
    }

    pub fn decode(id: ControlVmId, packet: &[u8; PACKET_SIZE]) -> Result<Self, MessageError> {
        let command = match id {
            ControlVmId::BusCreate => {
                let w: BusCreateWire = read_packet(packet)?;
                ControlVmCommand::BusCreate {
                    bus_no: w.bus_no.get(),
                    dev_count: w.dev_count.get(),
                    channel_addr: w.channel_addr.get(),
                    channel_bytes: w.channel_bytes.get(),
                    bus_data_type: w.bus_data_type,
                    bus_instance: w.bus_instance,
                }
            }
            ControlVmId::BusDestroy => {
                let w: BusDestroyWire = read_packet(packet)?;
                ControlVmCommand::BusDestroy {
                    bus_no: w.bus_no.get(),
                }
            }
            ControlVmId::BusConfigure => {
                let w: BusConfigureWire = read_packet(packet)?;
                ControlVmCommand::BusConfigure {
                    bus_no: w.bus_no.get(),
                    guest_handle: w.guest_handle.get(),
                    recv_bus_irq_handle: w.recv_bus_irq_handle.get(),
                }
            }
            ControlVmId::BusChangeState | ControlVmId::BusChangeStateEvent => {
                let w: BusChangeStateWire = read_packet(packet)?;
                let bus_no = w.bus_no.get();
                let state = SegmentState::from_bits_retain(w.state.get());
                if id == ControlVmId::BusChangeState {
                    ControlVmCommand::BusChangeState { bus_no, state }
                } else {
                    ControlVmCommand::BusChangeStateEvent { bus_no, state }
                }
            }
            ControlVmId::DeviceCreate => {
                let w: DeviceCreateWire = read_packet(packet)?;
                ControlVmCommand::DeviceCreate {
                    bus_no: w.bus_no.get(),
                    dev_no: w.dev_no.get(),
                    channel_addr: w.channel_addr.get(),
                    channel_bytes: w.channel_bytes.get(),
                    data_type: w.data_type,
                    dev_instance: w.dev_instance,
                    intr: IrqInfo::from(&w.intr),
                }
            }
            ControlVmId::DeviceDestroy
            | ControlVmId::DeviceConfigure
            | ControlVmId::DeviceReconfigure => {
                let w: DeviceAddressWire = read_packet(packet)?;
                let (bus_no, dev_no) = (w.bus_no.get(), w.dev_no.get());
                match id {
                    ControlVmId::DeviceDestroy => ControlVmCommand::DeviceDestroy { bus_no, dev_no },
                    ControlVmId::DeviceConfigure => {
                        ControlVmCommand::DeviceConfigure { bus_no, dev_no }
                    }
                    _ => ControlVmCommand::DeviceReconfigure { bus_no, dev_no },
                }
            }
            ControlVmId::DeviceChangeState => {
                let w: DeviceChangeStateWire = read_packet(packet)?;
                ControlVmCommand::DeviceChangeState {
                    bus_no: w.bus_no.get(),
                    dev_no: w.dev_no.get(),
                    state: SegmentState::from_bits_retain(w.state.get()),
                    phys_device: w.flags.get() & 1 != 0,
                }
            }
            ControlVmId::DeviceChangeStateEvent => {
                let w: DeviceChangeStateEventWire = read_packet(packet)?;
                ControlVmCommand::DeviceChangeStateEvent {
                    bus_no: w.bus_no.get(),
                    dev_no: w.dev_no.get(),
                    state: SegmentState::from_bits_retain(w.state.get()),
                }
            }
            ControlVmId::ChipsetInit => {
                let w: ChipsetInitWire = read_packet(packet)?;
                ControlVmCommand::ChipsetInit {
                    bus_count: w.bus_count.get(),
                    switch_count: w.switch_count.get(),
                    features: ChipsetFeatures::from_bits_retain(w.features.get()),
                    platform_number: w.platform_number.get(),
                }
            }
            ControlVmId::ChipsetStop => ControlVmCommand::ChipsetStop,
            ControlVmId::ChipsetReady => ControlVmCommand::ChipsetReady,
            ControlVmId::ChipsetSelftest => {
                let w: ChipsetSelftestWire = read_packet(packet)?;
                ControlVmCommand::ChipsetSelftest {
                    options: w.options.get(),
                    test: w.test.get(),
                }
            }
        };
        Ok(command)
    }

    /// Write this command's packet; bytes past its packet size are left alone.
    pub fn encode(&self, packet: &mut [u8; PACKET_SIZE]) {
        match *self {
            ControlVmCommand::BusCreate {
                bus_no,
                dev_count,
                channel_addr,
                channel_bytes,
                bus_data_type,
                bus_instance,
            } => write_packet(
                packet,
                &BusCreateWire {
                    bus_no: bus_no.into(),
                    dev_count: dev_count.into(),
                    channel_addr: channel_addr.into(),
                    channel_bytes: channel_bytes.into(),
                    bus_data_type,
                    bus_instance,
                },
            ),
            ControlVmCommand::BusDestroy { bus_no } => write_packet(
                packet,
                &BusDestroyWire {
                    bus_no: bus_no.into(),
                    reserved: 0.into(),
                },
            ),
            ControlVmCommand::BusConfigure {
                bus_no,
                guest_handle,
                recv_bus_irq_handle,
            } => write_packet(
                packet,
                &BusConfigureWire {
                    bus_no: bus_no.into(),
                    reserved1: 0.into(),
                    guest_handle: guest_handle.into(),
                    recv_bus_irq_handle: recv_bus_irq_handle.into(),
                },
            ),
            ControlVmCommand::BusChangeState { bus_no, state }
            | ControlVmCommand::BusChangeStateEvent { bus_no, state } => write_packet(
                packet,
                &BusChangeStateWire {
                    bus_no: bus_no.into(),
                    state: state.bits().into(),
                    reserved: [0; 2],
                },
            ),
            ControlVmCommand::DeviceCreate {
                bus_no,
                dev_no,
                channel_addr,
                channel_bytes,
                data_type,
                dev_instance,
                ref intr,
            } => write_packet(
                packet,
                &DeviceCreateWire {
                    bus_no: bus_no.into(),
                    dev_no: dev_no.into(),
                    channel_addr: channel_addr.into(),
                    channel_bytes: channel_bytes.into(),
                    data_type,
                    dev_instance,
                    intr: IrqInfoWire::from(intr),
                },
            ),
            ControlVmCommand::DeviceDestroy { bus_no, dev_no }
            | ControlVmCommand::DeviceConfigure { bus_no, dev_no }
            | ControlVmCommand::DeviceReconfigure { bus_no, dev_no } => write_packet(
                packet,
                &DeviceAddressWire {
                    bus_no: bus_no.into(),
                    dev_no: dev_no.into(),
                },
            ),
            ControlVmCommand::DeviceChangeState {
                bus_no,
                dev_no,
                state,
                phys_device,
            } => write_packet(
                packet,
                &DeviceChangeStateWire {
                    bus_no: bus_no.into(),
                    dev_no: dev_no.into(),
                    state: state.bits().into(),
                    flags: (phys_device as u32).into(),
                    flags_reserved: 0.into(),
                    reserved: [0; 2],
                },
            ),
            ControlVmCommand::DeviceChangeStateEvent {
                bus_no,
                dev_no,
                state,
            } => write_packet(
                packet,
                &DeviceChangeStateEventWire {
                    bus_no: bus_no.into(),
                    dev_no: dev_no.into(),
                    state: state.bits().into(),
                    reserved: [0; 6],
                },
            ),
            ControlVmCommand::ChipsetInit {
                bus_count,
                switch_count,
                features,
                platform_number,
            } => write_packet(
                packet,
                &ChipsetInitWire {
                    bus_count: bus_count.into(),
                    switch_count: switch_count.into(),
                    features: features.bits().into(),
                    platform_number: platform_number.into(),
                },
            ),
            ControlVmCommand::ChipsetStop | ControlVmCommand::ChipsetReady => {}
            ControlVmCommand::ChipsetSelftest { options, test } => write_packet(
                packet,
                &ChipsetSelftestWire {
                    options: options.into(),
                    test: test.into(),
                },
            ),
        }
    }
}

/// Everything in a message header except the id, which the command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub message_size: u32,
    pub segment_index: u32,
    pub completion_status: CompletionStatus,
    pub flags: MessageFlags,
    pub message_handle: u64,
    pub payload_vm_offset: u64,
    pub payload_max_bytes: u32,
    pub payload_bytes: u32,
}

impl MessageHeader {
    fn from_wire(w: &MessageHeaderWire) -> Self {
        Self {
            message_size: w.message_size.get(),
            segment_index: w.segment_index.get(),
            completion_status: CompletionStatus(w.completion_status.get()),
            flags: MessageFlags::from_bits_retain(w.flags.get()),
            message_handle: w.message_handle.get(),
            payload_vm_offset: w.payload_vm_offset.get(),
            payload_max_bytes: w.payload_max_bytes.get(),
            payload_bytes: w.payload_bytes.get(),
        }
    }

    fn to_wire(self, id: u32) -> MessageHeaderWire {
        MessageHeaderWire {
            id: id.into(),
            message_size: self.message_size.into(),
            segment_index: self.segment_index.into(),
            completion_status: self.completion_status.0.into(),
            flags: self.flags.bits().into(),
            reserved: 0.into(),
            message_handle: self.message_handle.into(),
            payload_vm_offset: self.payload_vm_offset.into(),
            payload_max_bytes: self.payload_max_bytes.into(),
            payload_bytes: self.payload_bytes.into(),
        }
    }

    /// The header of the response to a request carrying this header.
    pub fn into_response(mut self, status: CompletionStatus, partial: bool) -> Self {
        self.completion_status = status;
        self.flags.remove(MessageFlags::RESPONSE_EXPECTED);
        self.flags.set(MessageFlags::FAILED, !status.is_success());
        self.flags.set(MessageFlags::PARTIAL_COMPLETION, partial);
        self
    }
}

/// Id, handle and flags of a slot, readable even when the rest is garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub id: u32,
    pub header: MessageHeader,
}

impl RawHeader {
    pub fn parse(raw: &RawMessage) -> Result<Self, MessageError> {
        let wire = MessageWire::read_from_bytes(&raw[..])
            .map_err(|_| MessageError::Truncated(raw.len()))?;
        Ok(Self {
            id: wire.header.id.get(),
            header: MessageHeader::from_wire(&wire.header),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlVmMessage {
    pub header: MessageHeader,
    pub command: ControlVmCommand,
}

impl ControlVmMessage {
    /// A request that expects exactly one final response.
    pub fn request(command: ControlVmCommand, handle: u64) -> Self {
        Self {
            header: MessageHeader {
                message_size: MESSAGE_SIZE as u32,
                flags: MessageFlags::RESPONSE_EXPECTED,
                message_handle: handle,
                ..MessageHeader::default()
            },
            command,
        }
    }

    /// A message that expects no response.
    pub fn notification(command: ControlVmCommand, handle: u64) -> Self {
        let mut msg = Self::request(command, handle);
        msg.header.flags.remove(MessageFlags::RESPONSE_EXPECTED);
        msg
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.header.flags.insert(flags);
        self
    }

    pub fn with_segment(mut self, segment_index: u32) -> Self {
        self.header.segment_index = segment_index;
        self
    }

    pub fn with_payload(mut self, offset: u64, bytes: u32, max_bytes: u32) -> Self {
        self.header.payload_vm_offset = offset;
        self.header.payload_bytes = bytes;
        self.header.payload_max_bytes = max_bytes;
        self
    }

    pub fn id(&self) -> ControlVmId {
        self.command.id()
    }

    pub fn handle(&self) -> u64 {
        self.header.message_handle
    }

    pub fn status(&self) -> CompletionStatus {
        self.header.completion_status
    }

    pub fn response_expected(&self) -> bool {
        self.header.flags.contains(MessageFlags::RESPONSE_EXPECTED)
    }

    pub fn is_partial(&self) -> bool {
        self.header.flags.contains(MessageFlags::PARTIAL_COMPLETION)
    }

    pub fn is_failed(&self) -> bool {
        self.header.flags.contains(MessageFlags::FAILED)
    }

    pub fn preserve(&self) -> bool {
        self.header.flags.contains(MessageFlags::PRESERVE)
    }

    pub fn response(&self, status: CompletionStatus, partial: bool) -> Self {
        Self {
            header: self.header.into_response(status, partial),
            command: self.command,
        }
    }

    pub fn encode(&self) -> RawMessage {
        let mut packet = [0u8; PACKET_SIZE];
        self.command.encode(&mut packet);
        let wire = MessageWire {
            header: self.header.to_wire(self.id() as u32),
            packet,
        };
        let mut raw = [0u8; MESSAGE_SIZE];
        raw.copy_from_slice(wire.as_bytes());
        raw
    }

    /// Decode a slot, checking the id is known and `message_size` fits it.
    pub fn decode(raw: &RawMessage) -> Result<Self, MessageError> {
        let wire = MessageWire::read_from_bytes(&raw[..])
            .map_err(|_| MessageError::Truncated(raw.len()))?;
        let id = ControlVmId::try_from(wire.header.id.get())?;

        let message_size = wire.header.message_size.get();
        if !id.accepts_size(message_size) {
            return Err(MessageError::SizeMismatch {
                id,
                expected: (MESSAGE_HEADER_SIZE + id.packet_size()) as u32,
                actual: message_size,
            });
        }

        Ok(Self {
            header: MessageHeader::from_wire(&wire.header),
            command: ControlVmCommand::decode(id, &wire.packet)?,
        })
    }
}

/// Answer a slot that could not be decoded: header and packet bytes are
/// echoed verbatim, only status and flags change.
pub fn failure_response(raw: &RawMessage, status: CompletionStatus) -> Result<RawMessage, MessageError> {
    let mut wire =
        MessageWire::read_from_bytes(&raw[..]).map_err(|_| MessageError::Truncated(raw.len()))?;
    let header = MessageHeader::from_wire(&wire.header).into_response(status, false);
    wire.header = header.to_wire(wire.header.id.get());

    let mut out = [0u8; MESSAGE_SIZE];
    out.copy_from_slice(wire.as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::VHBA_CHANNEL_TYPE;

    fn sample(id: ControlVmId) -> ControlVmCommand {
        let guid = Guid::new(0xdeadbeef, 1, 2, [3, 4, 5, 6, 7, 8, 9, 10]);
        match id {
            ControlVmId::BusCreate => ControlVmCommand::BusCreate {
                bus_no: 3,
                dev_count: 16,
                channel_addr: 0x1_0000,
                channel_bytes: 0x2000,
                bus_data_type: guid,
                bus_instance: Guid::NIL,
            },
            ControlVmId::BusDestroy => ControlVmCommand::BusDestroy { bus_no: 3 },
            ControlVmId::BusConfigure => ControlVmCommand::BusConfigure {
                bus_no: 3,
                guest_handle: 0xaaaa,
                recv_bus_irq_handle: 0xbbbb,
            },
            ControlVmId::BusChangeState => ControlVmCommand::BusChangeState {
                bus_no: 3,
                state: SegmentState::PAUSED,
            },
            ControlVmId::BusChangeStateEvent => ControlVmCommand::BusChangeStateEvent {
                bus_no: 3,
                state: SegmentState::RUNNING,
            },
            ControlVmId::DeviceCreate => ControlVmCommand::DeviceCreate {
                bus_no: 3,
                dev_no: 7,
                channel_addr: 0x4_0000,
                channel_bytes: 0x1000,
                data_type: VHBA_CHANNEL_TYPE,
                dev_instance: guid,
                intr: IrqInfo {
                    recv_irq_handle: 0x55,
                    recv_irq_vector: 33,
                    recv_irq_shared: true,
                },
            },
            ControlVmId::DeviceDestroy => ControlVmCommand::DeviceDestroy { bus_no: 3, dev_no: 7 },
            ControlVmId::DeviceConfigure => ControlVmCommand::DeviceConfigure { bus_no: 3, dev_no: 7 },
            ControlVmId::DeviceReconfigure => {
                ControlVmCommand::DeviceReconfigure { bus_no: 3, dev_no: 7 }
            }
            ControlVmId::DeviceChangeState => ControlVmCommand::DeviceChangeState {
                bus_no: 3,
                dev_no: 7,
                state: SegmentState::STANDBY,
                phys_device: true,
            },
            ControlVmId::DeviceChangeStateEvent => ControlVmCommand::DeviceChangeStateEvent {
                bus_no: 3,
                dev_no: 7,
                state: SegmentState::RUNNING,
            },
            ControlVmId::ChipsetInit => ControlVmCommand::ChipsetInit {
                bus_count: 4,
                switch_count: 0,
                features: ChipsetFeatures::REPLY | ChipsetFeatures::PARA_HOTPLUG,
                platform_number: 9,
            },
            ControlVmId::ChipsetStop => ControlVmCommand::ChipsetStop,
            ControlVmId::ChipsetReady => ControlVmCommand::ChipsetReady,
            ControlVmId::ChipsetSelftest => ControlVmCommand::ChipsetSelftest { options: 0, test: 1 },
        }
    }

    #[test]
    fn test_every_command_survives_encode_decode() {
        for (i, id) in ControlVmId::ALL.into_iter().enumerate() {
            let msg = ControlVmMessage::request(sample(id), 0x1000 + i as u64)
                .with_segment(2)
                .with_payload(0x800, 96, 4096)
                .with_flags(MessageFlags::SERVER);
            let decoded = ControlVmMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg, "{id:?}");
            assert_eq!(decoded.id(), id);
        }
    }

    #[test]
    fn test_wire_offsets() {
        let msg = ControlVmMessage::request(sample(ControlVmId::DeviceChangeState), 0x0102_0304);
        let raw = msg.encode();

        assert_eq!(u32::from_ne_bytes(raw[0..4].try_into().unwrap()), 0x204);
        assert_eq!(u32::from_ne_bytes(raw[4..8].try_into().unwrap()), 128);
        assert_eq!(
            u32::from_ne_bytes(raw[16..20].try_into().unwrap()),
            MessageFlags::RESPONSE_EXPECTED.bits()
        );
        assert_eq!(u64::from_ne_bytes(raw[24..32].try_into().unwrap()), 0x0102_0304);
        // Packet: bus 3, dev 7, state at 8..10, flags at 10..14 (unaligned)
        assert_eq!(u32::from_ne_bytes(raw[48..52].try_into().unwrap()), 3);
        assert_eq!(u32::from_ne_bytes(raw[52..56].try_into().unwrap()), 7);
        assert_eq!(
            u16::from_ne_bytes(raw[56..58].try_into().unwrap()),
            SegmentState::STANDBY.bits()
        );
        assert_eq!(u32::from_ne_bytes(raw[58..62].try_into().unwrap()), 1);
    }

    #[test]
    fn test_packet_sizes() {
        assert_eq!(ControlVmId::BusCreate.packet_size(), 56);
        assert_eq!(ControlVmId::DeviceCreate.packet_size(), 80);
        assert_eq!(ControlVmId::DeviceChangeState.packet_size(), 20);
        assert_eq!(ControlVmId::ChipsetStop.packet_size(), 0);
    }

    #[test]
    fn test_compact_message_size_accepted() {
        let mut msg = ControlVmMessage::request(sample(ControlVmId::BusDestroy), 1);
        msg.header.message_size = 56;
        assert!(ControlVmMessage::decode(&msg.encode()).is_ok());
    }

    #[test]
    fn test_wrong_message_size_rejected() {
        let mut msg = ControlVmMessage::request(sample(ControlVmId::DeviceCreate), 1);
        msg.header.message_size = 64;
        let err = ControlVmMessage::decode(&msg.encode()).unwrap_err();
        assert_eq!(
            err,
            MessageError::SizeMismatch {
                id: ControlVmId::DeviceCreate,
                expected: 128,
                actual: 64
            }
        );
        assert_eq!(err.status(), CompletionStatus::PAYLOAD_INVALID);
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut raw = ControlVmMessage::request(ControlVmCommand::ChipsetReady, 1).encode();
        raw[0..4].copy_from_slice(&0x999u32.to_ne_bytes());
        let err = ControlVmMessage::decode(&raw).unwrap_err();
        assert_eq!(err, MessageError::UnknownId(0x999));
        assert_eq!(err.status(), CompletionStatus::ID_UNKNOWN);
    }

    #[test]
    fn test_response_flags() {
        let req = ControlVmMessage::request(sample(ControlVmId::DeviceCreate), 42)
            .with_flags(MessageFlags::PRESERVE);

        let ok = req.response(CompletionStatus::SUCCESS, false);
        assert_eq!(ok.handle(), 42);
        assert_eq!(ok.command, req.command);
        assert!(!ok.response_expected());
        assert!(!ok.is_failed());
        assert!(ok.preserve());

        let partial = req.response(CompletionStatus::SUCCESS, true);
        assert!(partial.is_partial());

        let failed = req.response(CompletionStatus::DEVICE_INVALID, false);
        assert!(failed.is_failed());
        assert!(!failed.is_partial());
        assert_eq!(failed.status(), CompletionStatus::DEVICE_INVALID);
    }

    #[test]
    fn test_failure_response_echoes_raw_slot() {
        let mut raw = ControlVmMessage::request(sample(ControlVmId::BusCreate), 77).encode();
        raw[0..4].copy_from_slice(&0x777u32.to_ne_bytes());

        let resp = failure_response(&raw, CompletionStatus::ID_UNKNOWN).unwrap();
        let parsed = RawHeader::parse(&resp).unwrap();
        assert_eq!(parsed.id, 0x777);
        assert_eq!(parsed.header.message_handle, 77);
        assert_eq!(parsed.header.completion_status, CompletionStatus::ID_UNKNOWN);
        assert!(parsed.header.flags.contains(MessageFlags::FAILED));
        assert!(!parsed.header.flags.contains(MessageFlags::RESPONSE_EXPECTED));
        assert_eq!(resp[48..], raw[48..]);
    }

    #[test]
    fn test_segment_state_presets() {
        assert!(SegmentState::RUNNING.contains(SegmentState::OPERATING));
        assert!(!SegmentState::RUNNING.contains(SegmentState::REVOKED));
        assert_eq!(
            SegmentState::PAUSED,
            SegmentState::RUNNING - SegmentState::OPERATING
        );
        assert_eq!(SegmentState::STANDBY, SegmentState::PAUSED - SegmentState::ALIVE);
    }
}
