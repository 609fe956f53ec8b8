use super::message::{ControlVmCommand, ControlVmId, ControlVmMessage, MessageFlags};
use super::payload::{ControlVmPayload, PayloadError};
use super::wire::{MESSAGE_SIZE, RawMessage};
use crate::attachment::ClientState;
use crate::channel::{Channel, ChannelState, Role};
use crate::diag::{self, DiagnosticSink, PostCode, Severity};
use crate::errors::ChannelError;
use crate::guid::Guid;
use crate::header::{CHANNEL_HEADER_SIZE, ChannelExpectation, ChannelHeader, VISOR_CHANNEL_SIGNATURE};
use crate::region::SharedRegion;
use crate::retry::RetryConfig;
use crate::signal_queue::{QueueStats, SIGNAL_QUEUE_HEADER_SIZE, SignalQueue, SignalQueueHeader, init_queue};
use static_assertions::const_assert_eq;
use std::mem::{offset_of, size_of};
use std::sync::Arc;
use zerocopy::byteorder::native_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const CONTROLVM_CHANNEL_TYPE: Guid = Guid::new(
    0x2b3c2d10,
    0x7ef5,
    0x4ad8,
    [0xb9, 0x66, 0x34, 0x48, 0xb7, 0x38, 0x6b, 0x3d],
);
pub const CONTROLVM_CHANNEL_VERSION: u32 = 1;
pub const CONTROLVM_MESSAGE_MAX: u32 = 64;
pub const CONTROLVM_CRASHMSG_MAX: usize = 2;

/// Channel-specific scalars between the header and the queues.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ControlVmScalars {
    pub gp_controlvm: U64,
    pub gp_partition_tables: U64,
    pub gp_diag_guest: U64,
    pub gp_boot_romdisk: U64,
    pub gp_boot_ramdisk: U64,
    pub gp_acpi_table: U64,
    pub gp_control_channel: U64,
    pub gp_diag_romdisk: U64,
    pub gp_nvram: U64,
    pub request_payload_offset: U64,
    pub event_payload_offset: U64,
    pub request_payload_bytes: U32,
    pub event_payload_bytes: U32,
    pub control_channel_bytes: U32,
    pub nvram_channel_bytes: U32,
    pub message_bytes: U32,
    pub message_count: U32,
    pub gp_smbios_table: U64,
    pub gp_physical_smbios_table: U64,
    pub gp_reserved: [u8; 2688],
    pub virtual_guest_firmware_image_base: U64,
    pub virtual_guest_firmware_entry_point: U64,
    pub virtual_guest_firmware_image_size: U64,
    pub virtual_guest_firmware_boot_base: U64,
    pub virtual_guest_image_base: U64,
    pub virtual_guest_image_size: U64,
    pub prototype_control_channel_offset: U64,
    pub virtual_guest_partition_handle: U64,
    pub restore_action: U16,
    pub dump_action: U16,
    pub nvram_fail_count: U16,
    pub saved_crash_message_count: U16,
    pub saved_crash_message_offset: U32,
    pub installation_error: U32,
    pub installation_text_id: U32,
    pub installation_remaining_steps: U16,
    pub tool_action: u8,
    pub reserved: u8,
    pub efi_visor_ind: U64,
    pub sp_reserved: U32,
    pub reserved2: [u8; 28],
}

pub const SCALARS_OFFSET: usize = CHANNEL_HEADER_SIZE;
pub const QUEUES_OFFSET: usize = SCALARS_OFFSET + size_of::<ControlVmScalars>();
pub const POOLS_OFFSET: usize = QUEUES_OFFSET + 4 * SIGNAL_QUEUE_HEADER_SIZE;
const POOL_SIZE: usize = CONTROLVM_MESSAGE_MAX as usize * MESSAGE_SIZE;
pub const CRASH_POOL_OFFSET: usize = POOLS_OFFSET + 4 * POOL_SIZE;
pub const CONTROLVM_FIXED_SIZE: usize = CRASH_POOL_OFFSET + CONTROLVM_CRASHMSG_MAX * MESSAGE_SIZE;

const_assert_eq!(size_of::<ControlVmScalars>(), 2944);
const_assert_eq!(QUEUES_OFFSET, 3072);
const_assert_eq!(POOLS_OFFSET, 3584);
const_assert_eq!(CRASH_POOL_OFFSET, 36352);
const_assert_eq!(CONTROLVM_FIXED_SIZE, 36608);

const SAVED_CRASH_COUNT_AT: usize =
    SCALARS_OFFSET + offset_of!(ControlVmScalars, saved_crash_message_count);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlVmQueue {
    /// Command → service.
    Request = 0,
    /// Service → command, answers to requests.
    Response = 1,
    /// Service → command, unsolicited.
    Event = 2,
    /// Command → service, answers to events.
    EventAck = 3,
}

impl ControlVmQueue {
    pub const ALL: [ControlVmQueue; 4] = [
        ControlVmQueue::Request,
        ControlVmQueue::Response,
        ControlVmQueue::Event,
        ControlVmQueue::EventAck,
    ];

    pub const fn header_offset(self) -> usize {
        QUEUES_OFFSET + self as usize * SIGNAL_QUEUE_HEADER_SIZE
    }

    pub const fn pool_offset(self) -> usize {
        POOLS_OFFSET + self as usize * POOL_SIZE
    }
}

/// Which kind of request a crash slot preserves.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashSlot {
    BusCreate = 0,
    DeviceCreate = 1,
}

impl CrashSlot {
    pub fn for_id(id: ControlVmId) -> Option<Self> {
        match id {
            ControlVmId::BusCreate => Some(CrashSlot::BusCreate),
            ControlVmId::DeviceCreate => Some(CrashSlot::DeviceCreate),
            _ => None,
        }
    }
}

/// Sizes of the variable part that follows the fixed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlVmLayout {
    pub request_payload_bytes: u32,
    pub event_payload_bytes: u32,
}

impl ControlVmLayout {
    pub fn request_payload_offset(&self) -> usize {
        CONTROLVM_FIXED_SIZE
    }

    pub fn event_payload_offset(&self) -> usize {
        CONTROLVM_FIXED_SIZE + self.request_payload_bytes as usize
    }

    pub fn total_size(&self) -> usize {
        self.event_payload_offset() + self.event_payload_bytes as usize
    }
}

pub fn controlvm_expectation() -> ChannelExpectation {
    ChannelExpectation {
        name: "controlvm",
        channel_type: CONTROLVM_CHANNEL_TYPE,
        min_size: CONTROLVM_FIXED_SIZE as u64,
        version: CONTROLVM_CHANNEL_VERSION,
        signature: VISOR_CHANNEL_SIGNATURE,
    }
}

/// The control channel, from either side.
///
/// The command partition creates and serves it; the chipset service
/// attaches as client.
pub struct ControlVmChannel {
    channel: Channel,
}

impl ControlVmChannel {
    /// Command side: lay out header, scalars, queues and crash pool, then
    /// mark the server ready.
    pub fn create(
        region: SharedRegion,
        layout: &ControlVmLayout,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ChannelError> {
        let header = ChannelHeader::new(
            CONTROLVM_CHANNEL_TYPE,
            layout.total_size() as u64,
            CONTROLVM_CHANNEL_VERSION,
            QUEUES_OFFSET as u64,
        );
        let channel = Channel::create(region, "controlvm", &header, diag)?;
        let region = channel.region();

        let mut scalars = <ControlVmScalars as FromZeros>::new_zeroed();
        scalars.request_payload_offset = (layout.request_payload_offset() as u64).into();
        scalars.event_payload_offset = (layout.event_payload_offset() as u64).into();
        scalars.request_payload_bytes = layout.request_payload_bytes.into();
        scalars.event_payload_bytes = layout.event_payload_bytes.into();
        scalars.message_bytes = (MESSAGE_SIZE as u32).into();
        scalars.message_count = CONTROLVM_MESSAGE_MAX.into();
        scalars.saved_crash_message_offset = (CRASH_POOL_OFFSET as u32).into();
        region.write(SCALARS_OFFSET, &scalars)?;

        for queue in ControlVmQueue::ALL {
            let header = SignalQueueHeader::new(
                queue as u32,
                MESSAGE_SIZE as u32,
                CONTROLVM_MESSAGE_MAX,
                (queue.pool_offset() - queue.header_offset()) as u64,
            );
            init_queue(region, queue.header_offset(), &header)?;
        }
        region.zero(CRASH_POOL_OFFSET, CONTROLVM_CRASHMSG_MAX * MESSAGE_SIZE)?;
        region.zero(
            layout.request_payload_offset(),
            layout.request_payload_bytes as usize + layout.event_payload_bytes as usize,
        )?;

        channel.mark_ready()?;
        Ok(Self { channel })
    }

    /// Command side, after a restart: validate and keep everything as is.
    pub fn open(region: SharedRegion, diag: Arc<dyn DiagnosticSink>) -> Result<Self, ChannelError> {
        let channel = Channel::open_server(region, &controlvm_expectation(), diag)?;
        Ok(Self { channel })
    }

    /// Service side: validate, wait-free check of server readiness, attach.
    pub fn attach(region: SharedRegion, diag: Arc<dyn DiagnosticSink>) -> Result<Self, ChannelError> {
        let channel = Channel::attach(region, &controlvm_expectation(), diag)?;
        Ok(Self { channel })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn role(&self) -> Role {
        self.channel.role()
    }

    pub fn current_state(&self) -> Result<ChannelState, ChannelError> {
        self.channel.current_state()
    }

    pub fn scalars(&self) -> Result<ControlVmScalars, ChannelError> {
        self.channel.region().read(SCALARS_OFFSET)
    }

    pub fn queue(&self, queue: ControlVmQueue) -> Result<SignalQueue<'_>, ChannelError> {
        SignalQueue::open(self.channel.region(), queue.header_offset(), MESSAGE_SIZE as u32)
    }

    pub fn queue_stats(&self, queue: ControlVmQueue) -> Result<QueueStats, ChannelError> {
        self.queue(queue)?.stats()
    }

    pub fn send(&self, queue: ControlVmQueue, message: &ControlVmMessage) -> Result<(), ChannelError> {
        self.send_raw(queue, &message.encode())
    }

    pub fn send_raw(&self, queue: ControlVmQueue, raw: &RawMessage) -> Result<(), ChannelError> {
        self.channel.ensure_usable()?;
        self.queue(queue)?.push(raw)
    }

    pub fn send_with_retry(
        &self,
        queue: ControlVmQueue,
        message: &ControlVmMessage,
        config: &RetryConfig,
    ) -> Result<(), ChannelError> {
        self.channel.ensure_usable()?;
        self.queue(queue)?.push_with_retry(&message.encode(), config)
    }

    pub fn try_receive_raw(&self, queue: ControlVmQueue) -> Result<Option<RawMessage>, ChannelError> {
        self.channel.ensure_usable()?;
        let mut raw = [0u8; MESSAGE_SIZE];
        Ok(self.queue(queue)?.pop_into(&mut raw)?.then_some(raw))
    }

    /// Pop and decode. A slot that fails to decode is consumed and reported
    /// as an error; use [`ControlVmChannel::try_receive_raw`] to answer it.
    pub fn try_receive(&self, queue: ControlVmQueue) -> Result<Option<ControlVmMessage>, ChannelError> {
        let Some(raw) = self.try_receive_raw(queue)? else {
            return Ok(None);
        };
        match ControlVmMessage::decode(&raw) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                diag::post(
                    self.channel.diag().as_ref(),
                    PostCode::new(diag::module::CONTROLVM, diag::event::MALFORMED_MESSAGE)
                        .with_line(queue as u16),
                    Severity::Warning,
                );
                Err(err.into())
            }
        }
    }

    fn payload_area(&self, queue: ControlVmQueue) -> Result<(usize, usize), ChannelError> {
        let scalars = self.scalars()?;
        let area = match queue {
            ControlVmQueue::Request | ControlVmQueue::Response => (
                scalars.request_payload_offset.get(),
                scalars.request_payload_bytes.get(),
            ),
            ControlVmQueue::Event | ControlVmQueue::EventAck => (
                scalars.event_payload_offset.get(),
                scalars.event_payload_bytes.get(),
            ),
        };
        Ok((area.0 as usize, area.1 as usize))
    }

    /// Copy `payload` into the payload area at `offset` (relative to the
    /// area) and return the message fields to reference it.
    ///
    /// Payloads that do not fit fail with `PayloadTooLarge`; nothing is
    /// truncated.
    pub fn write_payload(
        &self,
        queue: ControlVmQueue,
        offset: usize,
        payload: &ControlVmPayload,
    ) -> Result<PayloadRef, ChannelError> {
        let bytes = payload.encode();
        let (area, capacity) = self.payload_area(queue)?;
        let room = capacity.saturating_sub(offset);
        if bytes.len() > room {
            return Err(PayloadError::PayloadTooLarge {
                len: bytes.len(),
                capacity: room,
            }
            .into());
        }
        self.channel.region().write_bytes(area + offset, &bytes)?;
        Ok(PayloadRef {
            offset: (area + offset) as u64,
            bytes: bytes.len() as u32,
            max_bytes: room as u32,
        })
    }

    /// Read the payload a message references. `None` if it carries none.
    ///
    /// The span must lie inside the payload area of the message's queue (and
    /// within `payload_max_bytes` when set); otherwise nothing is read and the
    /// read fails with `PayloadTooLarge`.
    pub fn read_payload(&self, message: &ControlVmMessage) -> Result<Option<ControlVmPayload>, ChannelError> {
        let header = &message.header;
        let len = header.payload_bytes as usize;
        if len == 0 {
            return Ok(None);
        }
        let queue = if message.id().is_event() {
            ControlVmQueue::Event
        } else {
            ControlVmQueue::Request
        };
        let (area, capacity) = self.payload_area(queue)?;
        let mut room = usize::try_from(header.payload_vm_offset)
            .ok()
            .and_then(|offset| offset.checked_sub(area))
            .map_or(0, |within| capacity.saturating_sub(within));
        if header.payload_max_bytes > 0 {
            room = room.min(header.payload_max_bytes as usize);
        }
        if len > room {
            return Err(PayloadError::PayloadTooLarge { len, capacity: room }.into());
        }

        let mut bytes = vec![0u8; len];
        self.channel
            .region()
            .read_bytes(header.payload_vm_offset as usize, &mut bytes)?;
        Ok(Some(ControlVmPayload::parse(&bytes)?))
    }

    /// Keep the latest bus/device create for replay after a crash.
    pub fn save_crash_message(&self, message: &ControlVmMessage) -> Result<Option<CrashSlot>, ChannelError> {
        let Some(slot) = CrashSlot::for_id(message.id()) else {
            return Ok(None);
        };
        let region = self.channel.region();
        region.write_bytes(
            CRASH_POOL_OFFSET + slot as usize * MESSAGE_SIZE,
            &message.encode(),
        )?;
        region.write(SAVED_CRASH_COUNT_AT, &U16::new(CONTROLVM_CRASHMSG_MAX as u16))?;
        Ok(Some(slot))
    }

    pub fn crash_message(&self, index: usize) -> Result<Option<ControlVmMessage>, ChannelError> {
        if index >= CONTROLVM_CRASHMSG_MAX {
            return Err(ChannelError::CrashSlotOutOfRange(index));
        }
        let mut raw = [0u8; MESSAGE_SIZE];
        self.channel
            .region()
            .read_bytes(CRASH_POOL_OFFSET + index * MESSAGE_SIZE, &mut raw)?;
        if raw.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(ControlVmMessage::decode(&raw)?))
    }

    /// Saved requests, re-flagged with `PRESERVE` so replaying them does not
    /// wipe channels the guest is still using.
    ///
    /// A slot that no longer decodes is reported, zeroed and skipped.
    pub fn crash_replay(&self) -> Result<Vec<ControlVmMessage>, ChannelError> {
        let sink = self.channel.diag();
        let mut replay = Vec::new();
        for index in 0..CONTROLVM_CRASHMSG_MAX {
            let message = match self.crash_message(index) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(ChannelError::Message(err)) => {
                    tracing::warn!(slot = index, error = %err, "Discarding corrupt crash slot");
                    diag::post(
                        sink.as_ref(),
                        PostCode::new(diag::module::CONTROLVM, diag::event::CRASH_SLOT_CORRUPT)
                            .with_line(index as u16),
                        Severity::Warning,
                    );
                    self.channel
                        .region()
                        .zero(CRASH_POOL_OFFSET + index * MESSAGE_SIZE, MESSAGE_SIZE)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            diag::post(
                sink.as_ref(),
                PostCode::new(diag::module::CONTROLVM, diag::event::CRASH_REPLAY)
                    .with_line(index as u16),
                Severity::Info,
            );
            replay.push(message.with_flags(MessageFlags::PRESERVE));
        }
        Ok(replay)
    }

    pub fn clear_crash_messages(&self) -> Result<(), ChannelError> {
        self.channel
            .region()
            .zero(CRASH_POOL_OFFSET, CONTROLVM_CRASHMSG_MAX * MESSAGE_SIZE)
    }

    pub fn detach(&mut self) -> Result<(), ChannelError> {
        if self.role() == Role::Client
            && self.channel.current_state()?.client != ClientState::Detached
        {
            self.channel.detach()?;
        }
        Ok(())
    }
}

/// Where a written payload landed, in message-header terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRef {
    pub offset: u64,
    pub bytes: u32,
    pub max_bytes: u32,
}

impl ControlVmMessage {
    pub fn with_payload_ref(self, payload: PayloadRef) -> Self {
        self.with_payload(payload.offset, payload.bytes, payload.max_bytes)
    }
}

impl ControlVmCommand {
    /// Requests whose packet may reference a parameter payload.
    pub fn takes_payload(&self) -> bool {
        matches!(
            self.id(),
            ControlVmId::BusCreate | ControlVmId::DeviceCreate | ControlVmId::BusConfigure
        )
    }
}
