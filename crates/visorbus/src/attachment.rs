use crate::diag::{self, DiagnosticSink, PostCode, Severity};
use crate::errors::ChannelError;
use crate::header::{CLI_ERROR_OS_OFFSET, CLI_STATE_BOOT_OFFSET, CLI_STATE_OS_OFFSET, SRV_STATE_OFFSET};
use crate::region::SharedRegion;
use bitflags::bitflags;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Uninitialized = 0,
    Ready = 1,
}

impl TryFrom<u32> for ServerState {
    type Error = ChannelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ServerState::Uninitialized),
            1 => Ok(ServerState::Ready),
            _ => Err(ChannelError::UnknownState {
                field: "srv_state",
                value,
            }),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Detached = 0,
    Disabled = 1,
    Attaching = 2,
    Attached = 3,
    Busy = 4,
    Owned = 5,
}

impl ClientState {
    pub const ALL: [ClientState; 6] = [
        ClientState::Detached,
        ClientState::Disabled,
        ClientState::Attaching,
        ClientState::Attached,
        ClientState::Busy,
        ClientState::Owned,
    ];

    /// Whether a client in this state may touch channel content.
    pub fn is_attached(self) -> bool {
        matches!(
            self,
            ClientState::Attached | ClientState::Busy | ClientState::Owned
        )
    }
}

impl TryFrom<u32> for ClientState {
    type Error = ChannelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ClientState::ALL
            .get(value as usize)
            .copied()
            .ok_or(ChannelError::UnknownState {
                field: "cli_state",
                value,
            })
    }
}

/// The legal edges of the client axis. `Owned` has no way out; only an
/// external reset returns a channel to `Detached`.
pub fn can_transition(old: ClientState, new: ClientState) -> bool {
    use ClientState::*;
    matches!(
        (old, new),
        (Detached, Disabled)
            | (Attaching, Disabled)
            | (Attached, Disabled)
            | (Attaching, Detached)
            | (Attached, Detached)
            | (Detached, Attaching)
            | (Attaching, Attached)
            | (Detached, Attached)
            | (Busy, Attached)
            | (Attached, Busy)
            | (Detached, Owned)
            | (Disabled, Owned)
            | (Attaching, Owned)
            | (Attached, Owned)
            | (Busy, Owned)
    )
}

bitflags! {
    /// Bits of the header's per-client error-throttle byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThrottleClass: u8 {
        const DISABLED = 0x01;
        const NOT_ATTACHED = 0x02;
        const BUSY = 0x04;
    }
}

impl ThrottleClass {
    /// Class of an illegal attempt made from `old`.
    pub fn for_state(old: ClientState) -> Self {
        match old {
            ClientState::Disabled => ThrottleClass::DISABLED,
            ClientState::Busy => ThrottleClass::BUSY,
            _ => ThrottleClass::NOT_ATTACHED,
        }
    }

    fn index(self) -> usize {
        if self.contains(ThrottleClass::DISABLED) {
            0
        } else if self.contains(ThrottleClass::BUSY) {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ThrottleEntry {
    last_logged: Option<Instant>,
    suppressed: u64,
}

/// Rate limiter for illegal-transition warnings: at most one per class per
/// window.
#[derive(Debug, Clone)]
pub struct TransitionThrottle {
    window: Duration,
    entries: [ThrottleEntry; 3],
}

impl Default for TransitionThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl TransitionThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: [ThrottleEntry::default(); 3],
        }
    }

    /// Returns `Some(suppressed_since_last)` when this occurrence should be
    /// logged, `None` when it is swallowed.
    pub fn admit(&mut self, class: ThrottleClass, now: Instant) -> Option<u64> {
        let entry = &mut self.entries[class.index()];
        let due = match entry.last_logged {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        };
        if due {
            let suppressed = entry.suppressed;
            entry.last_logged = Some(now);
            entry.suppressed = 0;
            Some(suppressed)
        } else {
            entry.suppressed += 1;
            None
        }
    }

    pub fn suppressed(&self, class: ThrottleClass) -> u64 {
        self.entries[class.index()].suppressed
    }

    /// Forget history so the next illegal attempt is reported at once.
    pub fn clear(&mut self) {
        self.entries = [ThrottleEntry::default(); 3];
    }
}

/// The client's side of the attachment protocol for one channel.
///
/// Only the OS-client state word and its error byte are ever written;
/// the server axis is read-only from here.
pub struct ClientAttachment {
    throttle: TransitionThrottle,
    diag: Arc<dyn DiagnosticSink>,
}

impl ClientAttachment {
    pub fn new(diag: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            throttle: TransitionThrottle::default(),
            diag,
        }
    }

    pub fn with_throttle(mut self, throttle: TransitionThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn throttle(&self) -> &TransitionThrottle {
        &self.throttle
    }

    pub fn server_state(region: &SharedRegion) -> Result<ServerState, ChannelError> {
        ServerState::try_from(region.atomic_u32(SRV_STATE_OFFSET)?.load(Ordering::Acquire))
    }

    /// Written by the server only.
    pub fn set_server_state(region: &SharedRegion, state: ServerState) -> Result<(), ChannelError> {
        region
            .atomic_u32(SRV_STATE_OFFSET)?
            .store(state as u32, Ordering::Release);
        Ok(())
    }

    pub fn client_state(region: &SharedRegion) -> Result<ClientState, ChannelError> {
        ClientState::try_from(region.atomic_u32(CLI_STATE_OS_OFFSET)?.load(Ordering::Acquire))
    }

    pub fn boot_client_state(region: &SharedRegion) -> Result<ClientState, ChannelError> {
        ClientState::try_from(region.atomic_u32(CLI_STATE_BOOT_OFFSET)?.load(Ordering::Acquire))
    }

    pub fn error_bits(region: &SharedRegion) -> Result<ThrottleClass, ChannelError> {
        let bits = region.atomic_u8(CLI_ERROR_OS_OFFSET)?.load(Ordering::Acquire);
        Ok(ThrottleClass::from_bits_truncate(bits))
    }

    /// Move the client axis to `new` if the edge is legal.
    ///
    /// The word is re-read after the store; if it no longer holds `new`,
    /// the peer (or an external reset) got there first.
    pub fn transition(
        &mut self,
        region: &SharedRegion,
        new: ClientState,
    ) -> Result<(), ChannelError> {
        let old = Self::client_state(region)?;
        if !can_transition(old, new) {
            self.reject(region, old, new)?;
            return Err(ChannelError::IllegalTransition { from: old, to: new });
        }

        let word = region.atomic_u32(CLI_STATE_OS_OFFSET)?;
        word.store(new as u32, Ordering::Release);
        let read = ClientState::try_from(word.load(Ordering::Acquire))?;
        if read != new {
            diag::post(
                self.diag.as_ref(),
                PostCode::new(diag::module::ATTACHMENT, diag::event::TRANSITION_LOST)
                    .with_detail(new as u16, read as u16),
                Severity::Error,
            );
            return Err(ChannelError::TransitionLost { wrote: new, read });
        }

        region.atomic_u8(CLI_ERROR_OS_OFFSET)?.store(0, Ordering::Release);
        self.throttle.clear();
        tracing::debug!(from = ?old, to = ?new, "Client state transition");
        Ok(())
    }

    fn reject(
        &mut self,
        region: &SharedRegion,
        old: ClientState,
        new: ClientState,
    ) -> Result<(), ChannelError> {
        let class = ThrottleClass::for_state(old);
        region
            .atomic_u8(CLI_ERROR_OS_OFFSET)?
            .fetch_or(class.bits(), Ordering::AcqRel);

        if let Some(suppressed) = self.throttle.admit(class, Instant::now()) {
            tracing::warn!(
                from = ?old,
                to = ?new,
                class = ?class,
                suppressed,
                "Illegal client state transition"
            );
            diag::post(
                self.diag.as_ref(),
                PostCode::new(diag::module::ATTACHMENT, diag::event::ILLEGAL_TRANSITION)
                    .with_line(class.bits() as u16)
                    .with_detail(old as u16, new as u16),
                Severity::Warning,
            );
        }
        Ok(())
    }

    /// Claim the channel for an operation. `Owned` already implies exclusive use.
    pub fn acquire(&mut self, region: &SharedRegion) -> Result<(), ChannelError> {
        if Self::client_state(region)? == ClientState::Owned {
            return Ok(());
        }
        self.transition(region, ClientState::Busy)
    }

    pub fn release(&mut self, region: &SharedRegion) -> Result<(), ChannelError> {
        if Self::client_state(region)? == ClientState::Owned {
            return Ok(());
        }
        self.transition(region, ClientState::Attached)
    }

    /// External reset: the one way out of `Owned`.
    pub fn reset(&mut self, region: &SharedRegion) -> Result<(), ChannelError> {
        region
            .atomic_u32(CLI_STATE_OS_OFFSET)?
            .store(ClientState::Detached as u32, Ordering::Release);
        region.atomic_u8(CLI_ERROR_OS_OFFSET)?.store(0, Ordering::Release);
        self.throttle.clear();
        tracing::info!("Client state reset to Detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::RecordingDiagnostics;
    use crate::header::CHANNEL_HEADER_SIZE;
    use proptest::prelude::*;

    const LEGAL: [(ClientState, ClientState); 15] = {
        use ClientState::*;
        [
            (Detached, Disabled),
            (Attaching, Disabled),
            (Attached, Disabled),
            (Attaching, Detached),
            (Attached, Detached),
            (Detached, Attaching),
            (Attaching, Attached),
            (Detached, Attached),
            (Busy, Attached),
            (Attached, Busy),
            (Detached, Owned),
            (Disabled, Owned),
            (Attaching, Owned),
            (Attached, Owned),
            (Busy, Owned),
        ]
    };

    fn setup() -> (SharedRegion, ClientAttachment, Arc<RecordingDiagnostics>) {
        let region = SharedRegion::anonymous(CHANNEL_HEADER_SIZE).unwrap();
        let diag = Arc::new(RecordingDiagnostics::new());
        let attachment = ClientAttachment::new(diag.clone());
        (region, attachment, diag)
    }

    #[test]
    fn test_can_transition_matches_legal_list_exactly() {
        for old in ClientState::ALL {
            for new in ClientState::ALL {
                assert_eq!(
                    can_transition(old, new),
                    LEGAL.contains(&(old, new)),
                    "{old:?} -> {new:?}"
                );
            }
        }
    }

    #[test]
    fn test_owned_is_terminal() {
        for new in ClientState::ALL {
            assert!(!can_transition(ClientState::Owned, new));
        }
    }

    #[test]
    fn test_state_decoding() {
        assert_eq!(ClientState::try_from(3).unwrap(), ClientState::Attached);
        assert_eq!(ServerState::try_from(1).unwrap(), ServerState::Ready);
        assert!(matches!(
            ClientState::try_from(6),
            Err(ChannelError::UnknownState { value: 6, .. })
        ));
        assert!(ServerState::try_from(2).is_err());
    }

    #[test]
    fn test_attached_to_busy_accepted_attaching_rejected() {
        let (region, mut att, _) = setup();
        att.transition(&region, ClientState::Attached).unwrap();

        att.transition(&region, ClientState::Busy).unwrap();
        assert_eq!(ClientAttachment::client_state(&region).unwrap(), ClientState::Busy);

        att.transition(&region, ClientState::Attached).unwrap();
        let err = att
            .transition(&region, ClientState::Attaching)
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::IllegalTransition {
                from: ClientState::Attached,
                to: ClientState::Attaching
            }
        ));
        assert_eq!(
            ClientAttachment::client_state(&region).unwrap(),
            ClientState::Attached
        );
    }

    #[test]
    fn test_illegal_attempt_sets_error_bit_until_next_legal_transition() {
        let (region, mut att, _) = setup();
        att.transition(&region, ClientState::Disabled).unwrap();

        assert!(att.transition(&region, ClientState::Attached).is_err());
        assert_eq!(
            ClientAttachment::error_bits(&region).unwrap(),
            ThrottleClass::DISABLED
        );

        att.transition(&region, ClientState::Owned).unwrap();
        assert!(ClientAttachment::error_bits(&region).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_illegal_attempts_are_throttled() {
        let (region, mut att, diag) = setup();
        att.transition(&region, ClientState::Attached).unwrap();
        att.transition(&region, ClientState::Busy).unwrap();

        for _ in 0..5 {
            assert!(att.transition(&region, ClientState::Detached).is_err());
        }

        assert_eq!(diag.count_event(diag::event::ILLEGAL_TRANSITION), 1);
        assert_eq!(att.throttle().suppressed(ThrottleClass::BUSY), 4);
        assert_eq!(
            ClientAttachment::error_bits(&region).unwrap(),
            ThrottleClass::BUSY
        );
    }

    #[test]
    fn test_throttle_window() {
        let mut throttle = TransitionThrottle::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(throttle.admit(ThrottleClass::BUSY, t0), Some(0));
        assert_eq!(throttle.admit(ThrottleClass::BUSY, t0 + Duration::from_secs(1)), None);
        assert_eq!(throttle.admit(ThrottleClass::BUSY, t0 + Duration::from_secs(2)), None);
        // Other classes have their own budget
        assert_eq!(throttle.admit(ThrottleClass::DISABLED, t0), Some(0));
        assert_eq!(
            throttle.admit(ThrottleClass::BUSY, t0 + Duration::from_secs(10)),
            Some(2)
        );
    }

    #[test]
    fn test_acquire_release() {
        let (region, mut att, _) = setup();
        att.transition(&region, ClientState::Attached).unwrap();

        att.acquire(&region).unwrap();
        assert_eq!(ClientAttachment::client_state(&region).unwrap(), ClientState::Busy);
        assert!(att.acquire(&region).is_err());

        att.release(&region).unwrap();
        assert_eq!(
            ClientAttachment::client_state(&region).unwrap(),
            ClientState::Attached
        );
    }

    #[test]
    fn test_owned_acquires_without_transition_and_resets() {
        let (region, mut att, _) = setup();
        att.transition(&region, ClientState::Owned).unwrap();

        att.acquire(&region).unwrap();
        att.release(&region).unwrap();
        assert_eq!(ClientAttachment::client_state(&region).unwrap(), ClientState::Owned);
        assert!(att.transition(&region, ClientState::Detached).is_err());

        att.reset(&region).unwrap();
        assert_eq!(
            ClientAttachment::client_state(&region).unwrap(),
            ClientState::Detached
        );
    }

    #[test]
    fn test_server_axis_is_independent() {
        let (region, mut att, _) = setup();
        assert_eq!(
            ClientAttachment::server_state(&region).unwrap(),
            ServerState::Uninitialized
        );
        att.transition(&region, ClientState::Attached).unwrap();
        ClientAttachment::set_server_state(&region, ServerState::Ready).unwrap();

        assert_eq!(ClientAttachment::server_state(&region).unwrap(), ServerState::Ready);
        assert_eq!(
            ClientAttachment::client_state(&region).unwrap(),
            ClientState::Attached
        );
        assert_eq!(
            ClientAttachment::boot_client_state(&region).unwrap(),
            ClientState::Detached
        );
    }

    fn any_state() -> impl Strategy<Value = ClientState> {
        prop::sample::select(ClientState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_stored_state_follows_only_legal_edges(
            steps in prop::collection::vec(any_state(), 1..40)
        ) {
            let (region, mut att, _) = setup();
            let mut expected = ClientState::Detached;

            for new in steps {
                let result = att.transition(&region, new);
                if can_transition(expected, new) {
                    prop_assert!(result.is_ok());
                    expected = new;
                } else {
                    prop_assert!(result.is_err());
                }
                prop_assert_eq!(ClientAttachment::client_state(&region).unwrap(), expected);
            }
        }
    }
}
