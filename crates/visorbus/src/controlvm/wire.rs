//! Byte-exact ControlVM layouts. Everything is built from unaligned
//! native-endian integers so packed peer structures map one to one.

use crate::guid::Guid;
use static_assertions::const_assert_eq;
use std::mem::size_of;
use zerocopy::byteorder::native_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MESSAGE_HEADER_SIZE: usize = size_of::<MessageHeaderWire>();
pub const PACKET_SIZE: usize = 80;
pub const MESSAGE_SIZE: usize = size_of::<MessageWire>();

/// One ControlVM message slot.
pub type RawMessage = [u8; MESSAGE_SIZE];

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct MessageHeaderWire {
    pub id: U32,
    pub message_size: U32,
    pub segment_index: U32,
    pub completion_status: U32,
    pub flags: U32,
    pub reserved: U32,
    pub message_handle: U64,
    pub payload_vm_offset: U64,
    pub payload_max_bytes: U32,
    pub payload_bytes: U32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct MessageWire {
    pub header: MessageHeaderWire,
    pub packet: [u8; PACKET_SIZE],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct BusCreateWire {
    pub bus_no: U32,
    pub dev_count: U32,
    pub channel_addr: U64,
    pub channel_bytes: U64,
    pub bus_data_type: Guid,
    pub bus_instance: Guid,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct BusDestroyWire {
    pub bus_no: U32,
    pub reserved: U32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct BusConfigureWire {
    pub bus_no: U32,
    pub reserved1: U32,
    pub guest_handle: U64,
    pub recv_bus_irq_handle: U64,
}

/// Also used for `BUS_CHANGESTATE_EVENT`.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct BusChangeStateWire {
    pub bus_no: U32,
    pub state: U16,
    pub reserved: [u8; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct IrqInfoWire {
    pub reserved1: U64,
    pub recv_irq_handle: U64,
    pub recv_irq_vector: U32,
    pub recv_irq_shared: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeviceCreateWire {
    pub bus_no: U32,
    pub dev_no: U32,
    pub channel_addr: U64,
    pub channel_bytes: U64,
    pub data_type: Guid,
    pub dev_instance: Guid,
    pub intr: IrqInfoWire,
}

/// Device destroy, configure and reconfigure share this body.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeviceAddressWire {
    pub bus_no: U32,
    pub dev_no: U32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeviceChangeStateWire {
    pub bus_no: U32,
    pub dev_no: U32,
    pub state: U16,
    /// Bit 0: physical device.
    pub flags: U32,
    pub flags_reserved: U32,
    pub reserved: [u8; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeviceChangeStateEventWire {
    pub bus_no: U32,
    pub dev_no: U32,
    pub state: U16,
    pub reserved: [u8; 6],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChipsetInitWire {
    pub bus_count: U32,
    pub switch_count: U32,
    pub features: U32,
    pub platform_number: U32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChipsetSelftestWire {
    pub options: U32,
    pub test: U32,
}

const_assert_eq!(MESSAGE_HEADER_SIZE, 48);
const_assert_eq!(MESSAGE_SIZE, 128);
const_assert_eq!(size_of::<BusCreateWire>(), 56);
const_assert_eq!(size_of::<BusDestroyWire>(), 8);
const_assert_eq!(size_of::<BusConfigureWire>(), 24);
const_assert_eq!(size_of::<BusChangeStateWire>(), 8);
const_assert_eq!(size_of::<IrqInfoWire>(), 24);
const_assert_eq!(size_of::<DeviceCreateWire>(), PACKET_SIZE);
const_assert_eq!(size_of::<DeviceAddressWire>(), 8);
const_assert_eq!(size_of::<DeviceChangeStateWire>(), 20);
const_assert_eq!(size_of::<DeviceChangeStateEventWire>(), 16);
const_assert_eq!(size_of::<ChipsetInitWire>(), 16);
const_assert_eq!(size_of::<ChipsetSelftestWire>(), 8);

/// Header of the parameter block a message's payload offset points at.
/// Every `*_offset` is relative to the start of this header.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ParametersHeaderWire {
    pub total_length: U32,
    pub header_length: U32,
    pub connection_offset: U32,
    pub connection_length: U32,
    pub initiator_offset: U32,
    pub initiator_length: U32,
    pub target_offset: U32,
    pub target_length: U32,
    pub client_offset: U32,
    pub client_length: U32,
    pub name_offset: U32,
    pub name_length: U32,
    pub id: Guid,
    pub revision: U32,
    pub reserved: U32,
}

pub const PARAMETERS_HEADER_SIZE: usize = size_of::<ParametersHeaderWire>();
const_assert_eq!(PARAMETERS_HEADER_SIZE, 72);
