use crate::guid::Guid;
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::mem::{offset_of, size_of};
use thiserror::Error;
use zerocopy::byteorder::native_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Common header at offset 0 of every channel.
///
/// Layout is fixed by the peer: 128 bytes, no implicit padding, fields in
/// declaration order. `cli_state_os`, `srv_state` and the error-throttle
/// bytes are also accessed atomically in place; see [`crate::channel`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChannelHeader {
    pub signature: U64,
    /// Deprecated; superseded by the state words below.
    pub legacy_state: U32,
    pub header_size: U32,
    /// Total size of the channel in bytes.
    pub size: U64,
    pub features: U64,
    pub channel_type: Guid,
    pub partition_handle: U64,
    /// Device number of this channel in the client.
    pub handle: U64,
    /// Offset in bytes to the channel-specific area.
    pub ch_space_offset: U64,
    pub version_id: U32,
    pub partition_index: U32,
    pub zone: Guid,
    /// Offset to a NUL-terminated client string, 0 if absent.
    pub cli_str_offset: U32,
    pub cli_state_boot: U32,
    pub cmd_state_cli: U32,
    pub cli_state_os: U32,
    pub ch_characteristic: U32,
    pub cmd_state_srv: U32,
    pub srv_state: U32,
    pub cli_error_boot: u8,
    pub cli_error_os: u8,
    pub filler: [u8; 1],
    pub recover_channel: u8,
}

const_assert_eq!(size_of::<ChannelHeader>(), 128);

pub const CHANNEL_HEADER_SIZE: usize = size_of::<ChannelHeader>();

pub(crate) const CLI_STATE_BOOT_OFFSET: usize = offset_of!(ChannelHeader, cli_state_boot);
pub(crate) const CLI_STATE_OS_OFFSET: usize = offset_of!(ChannelHeader, cli_state_os);
pub(crate) const SRV_STATE_OFFSET: usize = offset_of!(ChannelHeader, srv_state);
pub(crate) const CLI_ERROR_OS_OFFSET: usize = offset_of!(ChannelHeader, cli_error_os);

const_assert_eq!(CLI_STATE_OS_OFFSET, 108);
const_assert_eq!(SRV_STATE_OFFSET, 120);
const_assert_eq!(CLI_ERROR_OS_OFFSET, 125);

pub const fn signature16(a: u8, b: u8) -> u64 {
    (a as u64) | ((b as u64) << 8)
}

pub const fn signature32(a: u8, b: u8, c: u8, d: u8) -> u64 {
    signature16(a, b) | (signature16(c, d) << 16)
}

/// `"ECNL"` read as a little-endian 32-bit value.
pub const VISOR_CHANNEL_SIGNATURE: u64 = signature32(b'E', b'C', b'N', b'L');

pub const VHBA_CHANNEL_TYPE: Guid = Guid::new(
    0x414815ed,
    0xc58c,
    0x11da,
    [0x95, 0xa9, 0x00, 0xe0, 0x81, 0x61, 0x16, 0x5f],
);

pub const VNIC_CHANNEL_TYPE: Guid = Guid::new(
    0x8cd5994d,
    0xc58e,
    0x11da,
    [0x95, 0xa9, 0x00, 0xe0, 0x81, 0x61, 0x16, 0x5f],
);

pub const SIOVM_TYPE: Guid = Guid::new(
    0x72120008,
    0x4aab,
    0x11dc,
    [0x85, 0x30, 0x44, 0x45, 0x53, 0x54, 0x42, 0x00],
);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelFeatures: u64 {
        const ENABLE_INTS = 1 << 0;
        const DRIVER_ENABLES_INTS = 1 << 1;
        const IS_POLLING = 1 << 3;
        const IOVM_OK_DRIVER_DISABLING_INTS = 1 << 4;
        const DRIVER_DISABLES_INTS = 1 << 5;
        const DRIVER_ENHANCED_RCVBUF_CHECKING = 1 << 6;
    }
}

impl ChannelHeader {
    /// A fresh header as written by the server when it allocates a channel.
    /// State words start at zero (`UNINITIALIZED` / `DETACHED`).
    pub fn new(channel_type: Guid, size: u64, version_id: u32, ch_space_offset: u64) -> Self {
        Self {
            signature: VISOR_CHANNEL_SIGNATURE.into(),
            legacy_state: 0.into(),
            header_size: (CHANNEL_HEADER_SIZE as u32).into(),
            size: size.into(),
            features: 0.into(),
            channel_type,
            partition_handle: 0.into(),
            handle: 0.into(),
            ch_space_offset: ch_space_offset.into(),
            version_id: version_id.into(),
            partition_index: 0.into(),
            zone: Guid::NIL,
            cli_str_offset: 0.into(),
            cli_state_boot: 0.into(),
            cmd_state_cli: 0.into(),
            cli_state_os: 0.into(),
            ch_characteristic: 0.into(),
            cmd_state_srv: 0.into(),
            srv_state: 0.into(),
            cli_error_boot: 0,
            cli_error_os: 0,
            filler: [0],
            recover_channel: 0,
        }
    }

    pub fn features(&self) -> ChannelFeatures {
        ChannelFeatures::from_bits_retain(self.features.get())
    }
}

/// What a client expects of a channel before trusting it. A zero or nil
/// field skips that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelExpectation {
    pub name: &'static str,
    pub channel_type: Guid,
    pub min_size: u64,
    pub version: u32,
    pub signature: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("channel {channel}: type mismatch, expected {expected} actual {actual}")]
    TypeMismatch {
        channel: &'static str,
        expected: Guid,
        actual: Guid,
    },

    #[error("channel {channel}: size mismatch, expected at least {expected:#x} actual {actual:#x}")]
    SizeMismatch {
        channel: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("channel {channel}: version mismatch, expected {expected:#x} actual {actual:#x}")]
    VersionMismatch {
        channel: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("channel {channel}: signature mismatch, expected {expected:#x} actual {actual:#x}")]
    SignatureMismatch {
        channel: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("channel {channel}: header size {header_size} does not fit in channel of {size} bytes")]
    HeaderSizeInvalid {
        channel: &'static str,
        header_size: u32,
        size: u64,
    },
}

impl ValidationError {
    /// Field index used in diagnostic post codes.
    pub fn field_code(&self) -> u16 {
        match self {
            ValidationError::TypeMismatch { .. } => 1,
            ValidationError::SizeMismatch { .. } => 2,
            ValidationError::VersionMismatch { .. } => 3,
            ValidationError::SignatureMismatch { .. } => 4,
            ValidationError::HeaderSizeInvalid { .. } => 5,
        }
    }
}

/// Check a channel header against what the caller expects.
///
/// Checks run in the order type, size, version, signature and stop at the
/// first mismatch. Each mismatch is logged with the field, expected and
/// actual values. The header is never modified.
pub fn validate(
    header: &ChannelHeader,
    expected: &ChannelExpectation,
) -> Result<(), ValidationError> {
    let channel = expected.name;

    if !expected.channel_type.is_nil() && header.channel_type != expected.channel_type {
        tracing::error!(
            channel,
            field = "type",
            expected = %expected.channel_type,
            actual = %header.channel_type,
            "Channel mismatch"
        );
        return Err(ValidationError::TypeMismatch {
            channel,
            expected: expected.channel_type,
            actual: header.channel_type,
        });
    }

    if expected.min_size > 0 && header.size.get() < expected.min_size {
        tracing::error!(
            channel,
            field = "size",
            expected = %format!("{:#x}", expected.min_size),
            actual = %format!("{:#x}", header.size.get()),
            "Channel mismatch"
        );
        return Err(ValidationError::SizeMismatch {
            channel,
            expected: expected.min_size,
            actual: header.size.get(),
        });
    }

    if expected.version > 0 && header.version_id.get() != expected.version {
        tracing::error!(
            channel,
            field = "version",
            expected = expected.version,
            actual = header.version_id.get(),
            "Channel mismatch"
        );
        return Err(ValidationError::VersionMismatch {
            channel,
            expected: expected.version,
            actual: header.version_id.get(),
        });
    }

    if expected.signature > 0 && header.signature.get() != expected.signature {
        tracing::error!(
            channel,
            field = "signature",
            expected = %format!("{:#x}", expected.signature),
            actual = %format!("{:#x}", header.signature.get()),
            "Channel mismatch"
        );
        return Err(ValidationError::SignatureMismatch {
            channel,
            expected: expected.signature,
            actual: header.signature.get(),
        });
    }

    Ok(())
}

pub fn is_valid(header: &ChannelHeader, expected: &ChannelExpectation) -> bool {
    validate(header, expected).is_ok()
}

/// `size ≥ header_size ≥ sizeof(ChannelHeader)`.
pub fn check_structure(header: &ChannelHeader, channel: &'static str) -> Result<(), ValidationError> {
    let header_size = header.header_size.get();
    if (header_size as usize) < CHANNEL_HEADER_SIZE || header.size.get() < header_size as u64 {
        return Err(ValidationError::HeaderSizeInvalid {
            channel,
            header_size,
            size: header.size.get(),
        });
    }
    Ok(())
}
