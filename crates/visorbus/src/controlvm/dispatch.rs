use super::channel::ControlVmChannel;
use super::message::{
    ChipsetFeatures, ControlVmCommand, ControlVmMessage, IrqInfo, MessageError, MessageFlags,
    MessageHeader, RawHeader, SegmentState, failure_response,
};
use super::payload::ControlVmPayload;
use super::status::CompletionStatus;
use super::wire::RawMessage;
use crate::diag::{self, DiagnosticSink, PostCode, Severity};
use crate::errors::ChannelError;
use crate::guid::Guid;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Final answer.
    Complete(CompletionStatus),
    /// Answer now, more follows through [`Dispatcher::complete`].
    Partial(CompletionStatus),
    /// No answer yet; [`Dispatcher::complete`] sends it.
    Deferred,
}

impl Outcome {
    pub const fn ok() -> Self {
        Outcome::Complete(CompletionStatus::SUCCESS)
    }
}

/// Header and parsed payload of the request being handled.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub header: &'a MessageHeader,
    pub payload: Option<&'a ControlVmPayload>,
}

impl Request<'_> {
    pub fn preserve(&self) -> bool {
        self.header.flags.contains(MessageFlags::PRESERVE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSpec {
    pub bus_no: u32,
    pub dev_count: u32,
    pub channel_addr: u64,
    pub channel_bytes: u64,
    pub bus_data_type: Guid,
    pub bus_instance: Guid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpec {
    pub bus_no: u32,
    pub dev_no: u32,
    pub channel_addr: u64,
    pub channel_bytes: u64,
    pub data_type: Guid,
    pub dev_instance: Guid,
    pub intr: IrqInfo,
}

/// The service side of the protocol, one method per lifecycle operation.
pub trait ChipsetHandler {
    fn chipset_init(
        &mut self,
        req: &Request<'_>,
        bus_count: u32,
        switch_count: u32,
        features: ChipsetFeatures,
    ) -> Outcome;
    fn chipset_ready(&mut self, req: &Request<'_>) -> Outcome;
    fn chipset_stop(&mut self, req: &Request<'_>) -> Outcome;

    fn chipset_selftest(&mut self, _req: &Request<'_>, _options: u32, _test: u32) -> Outcome {
        Outcome::ok()
    }

    fn bus_create(&mut self, req: &Request<'_>, bus: &BusSpec) -> Outcome;
    fn bus_destroy(&mut self, req: &Request<'_>, bus_no: u32) -> Outcome;
    fn bus_configure(&mut self, req: &Request<'_>, bus_no: u32, guest_handle: u64) -> Outcome;
    fn bus_change_state(&mut self, req: &Request<'_>, bus_no: u32, state: SegmentState) -> Outcome;

    fn device_create(&mut self, req: &Request<'_>, device: &DeviceSpec) -> Outcome;
    fn device_destroy(&mut self, req: &Request<'_>, bus_no: u32, dev_no: u32) -> Outcome;
    fn device_configure(&mut self, req: &Request<'_>, bus_no: u32, dev_no: u32) -> Outcome;
    fn device_reconfigure(&mut self, req: &Request<'_>, bus_no: u32, dev_no: u32) -> Outcome;
    fn device_change_state(
        &mut self,
        req: &Request<'_>,
        bus_no: u32,
        dev_no: u32,
        state: SegmentState,
        phys_device: bool,
    ) -> Outcome;
}

/// Where referenced payload bytes live.
pub trait PayloadSource {
    fn read_payload(&self, message: &ControlVmMessage) -> Result<Option<ControlVmPayload>, ChannelError>;
}

impl PayloadSource for ControlVmChannel {
    fn read_payload(&self, message: &ControlVmMessage) -> Result<Option<ControlVmPayload>, ChannelError> {
        ControlVmChannel::read_payload(self, message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub failed: u64,
    pub partial: u64,
    pub deferred: u64,
    pub malformed: u64,
}

/// Result of feeding one request slot to the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    /// The decoded request, if it decoded.
    pub request: Option<ControlVmMessage>,
    /// Slot to put on the response queue.
    pub response: Option<RawMessage>,
}

/// Routes requests to a [`ChipsetHandler`] and turns outcomes into
/// responses, keeping track of handles that still owe one.
pub struct Dispatcher<H> {
    handler: H,
    pending: HashMap<u64, ControlVmMessage>,
    diag: Arc<dyn DiagnosticSink>,
    stats: DispatchStats,
}

impl<H: ChipsetHandler> Dispatcher<H> {
    pub fn new(handler: H, diag: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            handler,
            pending: HashMap::new(),
            diag,
            stats: DispatchStats::default(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn pending(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending.keys().copied()
    }

    pub fn is_pending(&self, handle: u64) -> bool {
        self.pending.contains_key(&handle)
    }

    /// Handle a slot straight off the request queue.
    ///
    /// Slots that fail to decode are answered with a failure response
    /// echoing their header when they ask for one, and dropped otherwise.
    pub fn handle_raw(&mut self, raw: &RawMessage, payloads: &dyn PayloadSource) -> Dispatch {
        match ControlVmMessage::decode(raw) {
            Ok(message) => Dispatch {
                response: self.handle(&message, payloads).map(|r| r.encode()),
                request: Some(message),
            },
            Err(err) => Dispatch {
                request: None,
                response: self.reject_raw(raw, &err),
            },
        }
    }

    fn reject_raw(&mut self, raw: &RawMessage, err: &MessageError) -> Option<RawMessage> {
        self.stats.malformed += 1;
        let event = match err {
            MessageError::UnknownId(_) => diag::event::UNKNOWN_MESSAGE,
            _ => diag::event::MALFORMED_MESSAGE,
        };
        // A peer stuck sending garbage is reported at 1, 2, 4, 8, ...
        if self.stats.malformed.is_power_of_two() {
            diag::post(
                self.diag.as_ref(),
                PostCode::new(diag::module::CONTROLVM, event),
                Severity::Warning,
            );
            tracing::warn!(error = %err, rejected = self.stats.malformed, "Rejecting request");
        }

        let header = RawHeader::parse(raw).ok()?;
        if !header.header.flags.contains(MessageFlags::RESPONSE_EXPECTED) {
            return None;
        }
        self.stats.failed += 1;
        failure_response(raw, err.status()).ok()
    }

    /// Handle a decoded request. Returns the response to send now, if any.
    pub fn handle(
        &mut self,
        message: &ControlVmMessage,
        payloads: &dyn PayloadSource,
    ) -> Option<ControlVmMessage> {
        self.stats.handled += 1;
        let wants_response = message.response_expected();

        let payload = if message.command.takes_payload() {
            match payloads.read_payload(message) {
                Ok(payload) => payload,
                Err(err) => {
                    let status = match &err {
                        ChannelError::Payload(e) => e.status(),
                        _ => CompletionStatus::PAYLOAD_INVALID,
                    };
                    tracing::warn!(
                        id = ?message.id(),
                        handle = message.handle(),
                        error = %err,
                        "Payload rejected"
                    );
                    return self.finish(message, Outcome::Complete(status), wants_response);
                }
            }
        } else {
            None
        };

        let req = Request {
            header: &message.header,
            payload: payload.as_ref(),
        };
        let outcome = self.route(&req, &message.command);
        tracing::debug!(
            id = ?message.id(),
            handle = message.handle(),
            outcome = ?outcome,
            "Request handled"
        );
        self.finish(message, outcome, wants_response)
    }

    /// Run a crash-pool request again. Replays never produce a response.
    pub fn replay(&mut self, message: &ControlVmMessage, payloads: &dyn PayloadSource) -> Outcome {
        let mut message = *message;
        message.header.flags.remove(MessageFlags::RESPONSE_EXPECTED);
        message.header.flags.insert(MessageFlags::PRESERVE);

        let payload = if message.command.takes_payload() {
            payloads.read_payload(&message).ok().flatten()
        } else {
            None
        };
        let req = Request {
            header: &message.header,
            payload: payload.as_ref(),
        };
        self.route(&req, &message.command)
    }

    fn route(&mut self, req: &Request<'_>, command: &ControlVmCommand) -> Outcome {
        let h = &mut self.handler;
        match *command {
            ControlVmCommand::ChipsetInit {
                bus_count,
                switch_count,
                features,
                ..
            } => h.chipset_init(req, bus_count, switch_count, features),
            ControlVmCommand::ChipsetReady => h.chipset_ready(req),
            ControlVmCommand::ChipsetStop => h.chipset_stop(req),
            ControlVmCommand::ChipsetSelftest { options, test } => {
                h.chipset_selftest(req, options, test)
            }
            ControlVmCommand::BusCreate {
                bus_no,
                dev_count,
                channel_addr,
                channel_bytes,
                bus_data_type,
                bus_instance,
            } => h.bus_create(
                req,
                &BusSpec {
                    bus_no,
                    dev_count,
                    channel_addr,
                    channel_bytes,
                    bus_data_type,
                    bus_instance,
                },
            ),
            ControlVmCommand::BusDestroy { bus_no } => h.bus_destroy(req, bus_no),
            ControlVmCommand::BusConfigure {
                bus_no,
                guest_handle,
                ..
            } => h.bus_configure(req, bus_no, guest_handle),
            ControlVmCommand::BusChangeState { bus_no, state } => {
                h.bus_change_state(req, bus_no, state)
            }
            ControlVmCommand::DeviceCreate {
                bus_no,
                dev_no,
                channel_addr,
                channel_bytes,
                data_type,
                dev_instance,
                intr,
            } => h.device_create(
                req,
                &DeviceSpec {
                    bus_no,
                    dev_no,
                    channel_addr,
                    channel_bytes,
                    data_type,
                    dev_instance,
                    intr,
                },
            ),
            ControlVmCommand::DeviceDestroy { bus_no, dev_no } => {
                h.device_destroy(req, bus_no, dev_no)
            }
            ControlVmCommand::DeviceConfigure { bus_no, dev_no } => {
                h.device_configure(req, bus_no, dev_no)
            }
            ControlVmCommand::DeviceReconfigure { bus_no, dev_no } => {
                h.device_reconfigure(req, bus_no, dev_no)
            }
            ControlVmCommand::DeviceChangeState {
                bus_no,
                dev_no,
                state,
                phys_device,
            } => h.device_change_state(req, bus_no, dev_no, state, phys_device),
            // Events only travel service → command
            ControlVmCommand::BusChangeStateEvent { .. }
            | ControlVmCommand::DeviceChangeStateEvent { .. } => {
                Outcome::Complete(CompletionStatus::ID_UNKNOWN)
            }
        }
    }

    fn finish(
        &mut self,
        message: &ControlVmMessage,
        outcome: Outcome,
        wants_response: bool,
    ) -> Option<ControlVmMessage> {
        match outcome {
            Outcome::Complete(status) => {
                if !status.is_success() {
                    self.stats.failed += 1;
                }
                wants_response.then(|| message.response(status, false))
            }
            Outcome::Partial(status) => {
                self.stats.partial += 1;
                if !wants_response {
                    return None;
                }
                self.track(message);
                Some(message.response(status, true))
            }
            Outcome::Deferred => {
                self.stats.deferred += 1;
                if wants_response {
                    self.track(message);
                }
                None
            }
        }
    }

    fn track(&mut self, message: &ControlVmMessage) {
        if self.pending.insert(message.handle(), *message).is_some() {
            tracing::warn!(handle = message.handle(), "Handle reused while still pending");
        }
    }

    /// Send a progress response for a pending handle without finishing it.
    pub fn progress(&mut self, handle: u64, status: CompletionStatus) -> Option<ControlVmMessage> {
        let request = self.pending.get(&handle)?;
        self.stats.partial += 1;
        Some(request.response(status, true))
    }

    /// Final response for a deferred or partial handle. `None` if nothing is
    /// pending under `handle`.
    pub fn complete(&mut self, handle: u64, status: CompletionStatus) -> Option<ControlVmMessage> {
        let Some(request) = self.pending.remove(&handle) else {
            tracing::warn!(handle, "Completion for unknown handle");
            return None;
        };
        if !status.is_success() {
            self.stats.failed += 1;
        }
        Some(request.response(status, false))
    }
}
