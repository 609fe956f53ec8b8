use crate::errors::ChannelError;
use crate::region::SharedRegion;
use crate::retry::RetryConfig;
use static_assertions::const_assert_eq;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use zerocopy::byteorder::native_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Queue header shared by producer and consumer: two cache lines.
///
/// The first line is written by the producer (`head`, `num_sent`,
/// `num_overflows`), the second by the consumer (`tail`, `num_received`,
/// `num_empty`, `num_irq_received`).
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct SignalQueueHeader {
    pub version: U32,
    pub chtype: U32,
    /// Bytes of slot storage.
    pub size: U64,
    /// From this header to slot 0.
    pub sig_base_offset: U64,
    pub features: U64,
    pub num_sent: U64,
    pub num_overflows: U64,
    pub signal_size: U32,
    pub max_slots: U32,
    pub max_signals: U32,
    pub head: U32,
    pub num_received: U64,
    pub tail: U32,
    pub reserved1: U32,
    pub reserved2: U64,
    pub client_queue: U64,
    pub num_irq_received: U64,
    pub num_empty: U64,
    pub errorflags: U32,
    pub filler: [u8; 12],
}

const_assert_eq!(size_of::<SignalQueueHeader>(), 128);

pub const SIGNAL_QUEUE_HEADER_SIZE: usize = size_of::<SignalQueueHeader>();
pub const SIGNAL_QUEUE_VERSION: u32 = 1;

const HEAD: usize = offset_of!(SignalQueueHeader, head);
const TAIL: usize = offset_of!(SignalQueueHeader, tail);
const NUM_SENT: usize = offset_of!(SignalQueueHeader, num_sent);
const NUM_OVERFLOWS: usize = offset_of!(SignalQueueHeader, num_overflows);
const NUM_RECEIVED: usize = offset_of!(SignalQueueHeader, num_received);
const NUM_IRQ_RECEIVED: usize = offset_of!(SignalQueueHeader, num_irq_received);
const NUM_EMPTY: usize = offset_of!(SignalQueueHeader, num_empty);

const_assert_eq!(HEAD, 60);
const_assert_eq!(TAIL, 72);
const_assert_eq!(NUM_EMPTY, 104);

impl SignalQueueHeader {
    pub fn new(chtype: u32, signal_size: u32, max_slots: u32, sig_base_offset: u64) -> Self {
        Self {
            version: SIGNAL_QUEUE_VERSION.into(),
            chtype: chtype.into(),
            size: (signal_size as u64 * max_slots as u64).into(),
            sig_base_offset: sig_base_offset.into(),
            features: 0.into(),
            num_sent: 0.into(),
            num_overflows: 0.into(),
            signal_size: signal_size.into(),
            max_slots: max_slots.into(),
            max_signals: max_slots.saturating_sub(1).into(),
            head: 0.into(),
            num_received: 0.into(),
            tail: 0.into(),
            reserved1: 0.into(),
            reserved2: 0.into(),
            client_queue: 0.into(),
            num_irq_received: 0.into(),
            num_empty: 0.into(),
            errorflags: 0.into(),
            filler: [0; 12],
        }
    }
}

/// Write a fresh queue header at `offset` and zero its slots. Server only.
pub fn init_queue(
    region: &SharedRegion,
    offset: usize,
    header: &SignalQueueHeader,
) -> Result<(), ChannelError> {
    let slots_at = offset + header.sig_base_offset.get() as usize;
    let slots_len = header.size.get() as usize;
    region.check_range(offset, SIGNAL_QUEUE_HEADER_SIZE)?;
    region.check_range(slots_at, slots_len)?;

    region.zero(slots_at, slots_len)?;
    region.write(offset, header)?;
    tracing::debug!(
        offset,
        signal_size = header.signal_size.get(),
        max_slots = header.max_slots.get(),
        "Signal queue initialised"
    );
    Ok(())
}

/// Snapshot of a queue's counters. Fields are read one by one, so the
/// snapshot is not atomic as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub head: u32,
    pub tail: u32,
    pub num_sent: u64,
    pub num_received: u64,
    pub num_overflows: u64,
    pub num_empty: u64,
    pub num_irq_received: u64,
}

/// A view of one signal queue inside a channel.
///
/// Each queue has exactly one producer and one consumer, normally in
/// different partitions. Nothing here enforces that: a party must only
/// call `push*` on queues it produces into and `pop*` on queues it consumes.
///
/// SAFETY & MEMORY ORDERING:
///
/// Producer: copy slot bytes, then `head.store(Release)`.
/// Consumer: `head.load(Acquire)`, copy slot bytes, then `tail.store(Release)`.
/// The producer loads `tail` with Acquire so it never overwrites a slot
/// the consumer is still copying out.
pub struct SignalQueue<'a> {
    region: &'a SharedRegion,
    offset: usize,
    slots_at: usize,
    signal_size: u32,
    max_slots: u32,
}

impl<'a> SignalQueue<'a> {
    /// Open the queue whose header lives at `offset`.
    ///
    /// `signal_size` is what this party will push or pop; a queue built for
    /// a different slot size is a configuration error.
    pub fn open(
        region: &'a SharedRegion,
        offset: usize,
        signal_size: u32,
    ) -> Result<Self, ChannelError> {
        if offset % 8 != 0 {
            return Err(ChannelError::InvalidQueue {
                offset,
                reason: "header not 8-byte aligned",
            });
        }
        if signal_size == 0 {
            return Err(ChannelError::InvalidQueue {
                offset,
                reason: "zero-byte signals",
            });
        }
        let header: SignalQueueHeader = region.read(offset)?;

        let actual = header.signal_size.get();
        if actual != signal_size {
            return Err(ChannelError::SignalSizeMismatch {
                expected: signal_size,
                actual,
            });
        }

        let max_slots = header.max_slots.get();
        if max_slots < 2 {
            return Err(ChannelError::InvalidQueue {
                offset,
                reason: "fewer than two slots",
            });
        }
        if header.max_signals.get() != max_slots - 1 {
            return Err(ChannelError::InvalidQueue {
                offset,
                reason: "max_signals is not max_slots - 1",
            });
        }

        let slots_at = usize::try_from(header.sig_base_offset.get())
            .ok()
            .and_then(|base| offset.checked_add(base))
            .ok_or(ChannelError::InvalidQueue {
                offset,
                reason: "slot offset overflows",
            })?;
        let slots_len = signal_size as usize * max_slots as usize;
        region
            .check_range(slots_at, slots_len)
            .map_err(|_| ChannelError::InvalidQueue {
                offset,
                reason: "slots extend past end of channel",
            })?;

        Ok(Self {
            region,
            offset,
            slots_at,
            signal_size,
            max_slots,
        })
    }

    fn u32_at(&self, field: usize) -> Result<&'a AtomicU32, ChannelError> {
        self.region.atomic_u32(self.offset + field)
    }

    fn u64_at(&self, field: usize) -> Result<&'a AtomicU64, ChannelError> {
        self.region.atomic_u64(self.offset + field)
    }

    fn cursor(&self, name: &'static str, field: usize, order: Ordering) -> Result<u32, ChannelError> {
        let value = self.u32_at(field)?.load(order);
        if value >= self.max_slots {
            tracing::error!(
                queue_offset = self.offset,
                cursor = name,
                value,
                max_slots = self.max_slots,
                "Corrupt signal queue cursor"
            );
            return Err(ChannelError::CorruptCursor {
                cursor: name,
                value,
                max_slots: self.max_slots,
            });
        }
        Ok(value)
    }

    fn slot_offset(&self, index: u32) -> usize {
        self.slots_at + index as usize * self.signal_size as usize
    }

    pub fn signal_size(&self) -> u32 {
        self.signal_size
    }

    /// Slots in the ring, including the one that always stays empty.
    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Signals the queue can hold at once.
    pub fn capacity(&self) -> u32 {
        self.max_slots - 1
    }

    /// Copy one signal into the slot at `head` and publish it.
    ///
    /// `signal` shorter than the slot is zero-padded; longer is rejected.
    pub fn push(&self, signal: &[u8]) -> Result<(), ChannelError> {
        if signal.len() > self.signal_size as usize {
            return Err(ChannelError::SignalSizeMismatch {
                expected: self.signal_size,
                actual: signal.len() as u32,
            });
        }

        let head = self.cursor("head", HEAD, Ordering::Relaxed)?;
        let tail = self.cursor("tail", TAIL, Ordering::Acquire)?;
        let next = (head + 1) % self.max_slots;
        if next == tail {
            self.u64_at(NUM_OVERFLOWS)?.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::QueueFull);
        }

        let slot = self.slot_offset(head);
        self.region.write_bytes(slot, signal)?;
        if signal.len() < self.signal_size as usize {
            self.region
                .zero(slot + signal.len(), self.signal_size as usize - signal.len())?;
        }

        self.u32_at(HEAD)?.store(next, Ordering::Release);
        self.u64_at(NUM_SENT)?.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `push`, sleeping with exponential backoff while the queue is full.
    pub fn push_with_retry(&self, signal: &[u8], config: &RetryConfig) -> Result<(), ChannelError> {
        let mut attempt = 0;
        loop {
            match self.push(signal) {
                Err(ChannelError::QueueFull) if attempt < config.max_attempts => {
                    std::thread::sleep(config.delay_for_attempt(attempt));
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Copy the signal at `tail` into `buf` and release the slot.
    ///
    /// Returns `false` (and counts an empty poll) when there is nothing to read.
    pub fn pop_into(&self, buf: &mut [u8]) -> Result<bool, ChannelError> {
        if buf.len() != self.signal_size as usize {
            return Err(ChannelError::SignalSizeMismatch {
                expected: buf.len() as u32,
                actual: self.signal_size,
            });
        }

        let tail = self.cursor("tail", TAIL, Ordering::Relaxed)?;
        let head = self.cursor("head", HEAD, Ordering::Acquire)?;
        if head == tail {
            self.u64_at(NUM_EMPTY)?.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        self.region.read_bytes(self.slot_offset(tail), buf)?;

        self.u32_at(TAIL)?
            .store((tail + 1) % self.max_slots, Ordering::Release);
        self.u64_at(NUM_RECEIVED)?.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    pub fn pop(&self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut buf = vec![0u8; self.signal_size as usize];
        Ok(self.pop_into(&mut buf)?.then_some(buf))
    }

    /// Signals currently queued, as seen from either side.
    pub fn len(&self) -> Result<u32, ChannelError> {
        let head = self.cursor("head", HEAD, Ordering::Acquire)?;
        let tail = self.cursor("tail", TAIL, Ordering::Acquire)?;
        let slots = u64::from(self.max_slots);
        Ok(((u64::from(head) + slots - u64::from(tail)) % slots) as u32)
    }

    pub fn is_empty(&self) -> Result<bool, ChannelError> {
        Ok(self.len()? == 0)
    }

    pub fn is_full(&self) -> Result<bool, ChannelError> {
        Ok(self.len()? == self.capacity())
    }

    /// Count a doorbell/interrupt delivered for this queue. Consumer side.
    pub fn note_interrupt(&self) -> Result<(), ChannelError> {
        self.u64_at(NUM_IRQ_RECEIVED)?.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Result<QueueStats, ChannelError> {
        Ok(QueueStats {
            head: self.u32_at(HEAD)?.load(Ordering::Acquire),
            tail: self.u32_at(TAIL)?.load(Ordering::Acquire),
            num_sent: self.u64_at(NUM_SENT)?.load(Ordering::Relaxed),
            num_received: self.u64_at(NUM_RECEIVED)?.load(Ordering::Relaxed),
            num_overflows: self.u64_at(NUM_OVERFLOWS)?.load(Ordering::Relaxed),
            num_empty: self.u64_at(NUM_EMPTY)?.load(Ordering::Relaxed),
            num_irq_received: self.u64_at(NUM_IRQ_RECEIVED)?.load(Ordering::Relaxed),
        })
    }
}
