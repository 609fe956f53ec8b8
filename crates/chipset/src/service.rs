use crate::config::ChipsetConfig;
use crate::registry::BusRegistry;
use anyhow::Context;
use common::wait_for_resource;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use visorbus::controlvm::{
    ChipsetFeatures, ControlVmChannel, ControlVmCommand, ControlVmId,
    ControlVmMessage, ControlVmQueue, Dispatcher, RawHeader, RawMessage,
};
use visorbus::{
    ChannelError, ChannelLocator, DiagnosticSink, FileChannelLocator, FileRegionMapper, RegionMapper,
    TracingDiagnostics,
};

#[cfg(feature = "semaphores")]
use visorbus::Doorbell;

/// Unacked events kept for correlation; the oldest is forgotten beyond this.
const MAX_OUTSTANDING_EVENTS: usize = 256;
/// Events parked behind a full event queue; the oldest is dropped beyond this.
const MAX_EVENT_BACKLOG: usize = 64;

struct ServiceMetrics {
    requests: Counter<u64>,
    failed: Counter<u64>,
    deferred_sends: Counter<u64>,
    events: Counter<u64>,
}

impl ServiceMetrics {
    fn new() -> Self {
        let meter = global::meter("chipset");
        Self {
            requests: meter
                .u64_counter("chipset_requests_total")
                .with_description("ControlVM requests taken off the request queue")
                .build(),
            failed: meter
                .u64_counter("chipset_failed_responses_total")
                .with_description("Responses sent with a non-success status")
                .build(),
            deferred_sends: meter
                .u64_counter("chipset_deferred_sends_total")
                .with_description("Responses or events parked because their queue was full")
                .build(),
            events: meter
                .u64_counter("chipset_events_total")
                .with_description("Events posted to the command partition")
                .build(),
        }
    }
}

#[cfg(feature = "semaphores")]
struct Doorbells {
    request: Doorbell,
    response: Doorbell,
}

/// Counts from one pass of [`ChipsetService::poll_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub requests: usize,
    pub responses: usize,
    pub events: usize,
    pub acks: usize,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Service-partition side of the ControlVM channel.
pub struct ChipsetService {
    config: ChipsetConfig,
    channel: ControlVmChannel,
    dispatcher: Dispatcher<BusRegistry>,
    diag: Arc<dyn DiagnosticSink>,
    /// Responses that found the response queue full.
    backlog: VecDeque<RawMessage>,
    /// Events that found the event queue full.
    event_backlog: VecDeque<ControlVmMessage>,
    /// Posted events awaiting an ack, by handle.
    outstanding_events: BTreeMap<u64, ControlVmMessage>,
    next_event_handle: u64,
    metrics: ServiceMetrics,
    #[cfg(feature = "semaphores")]
    doorbells: Option<Doorbells>,
}

impl ChipsetService {
    /// Wait for the command partition to publish the channel, attach, and
    /// replay whatever the crash pool holds. `None` if shut down first.
    pub fn connect(config: ChipsetConfig, shutdown: &AtomicBool) -> anyhow::Result<Option<Self>> {
        let diag: Arc<dyn DiagnosticSink> = Arc::new(TracingDiagnostics);
        let Some(channel) = Self::attach(&config, &diag, shutdown) else {
            return Ok(None);
        };
        let mut service = Self::with_channel(config, channel, diag)?;
        service.replay_crash_pool()?;
        Ok(Some(service))
    }

    fn attach(
        config: &ChipsetConfig,
        diag: &Arc<dyn DiagnosticSink>,
        shutdown: &AtomicBool,
    ) -> Option<ControlVmChannel> {
        wait_for_resource(
            || -> Result<ControlVmChannel, ChannelError> {
                let locator = FileChannelLocator::new(&config.controlvm_path);
                let (address, len) = locator.locate_controlvm_channel()?;
                let region = FileRegionMapper::new(&config.controlvm_path)
                    .map_shared_region(address, len)?;
                ControlVmChannel::attach(region, diag.clone())
            },
            config.poll_interval,
            "ControlVM channel",
            shutdown,
        )
    }

    pub fn with_channel(
        config: ChipsetConfig,
        channel: ControlVmChannel,
        diag: Arc<dyn DiagnosticSink>,
    ) -> anyhow::Result<Self> {
        #[cfg(feature = "semaphores")]
        let doorbells = if config.use_doorbell {
            Some(Self::open_doorbells(&config)?)
        } else {
            None
        };

        Ok(Self {
            dispatcher: Dispatcher::new(BusRegistry::new(diag.clone()), diag.clone()),
            config,
            channel,
            diag,
            backlog: VecDeque::new(),
            event_backlog: VecDeque::new(),
            outstanding_events: BTreeMap::new(),
            next_event_handle: 1,
            metrics: ServiceMetrics::new(),
            #[cfg(feature = "semaphores")]
            doorbells,
        })
    }

    #[cfg(feature = "semaphores")]
    fn open_doorbells(config: &ChipsetConfig) -> anyhow::Result<Doorbells> {
        let request = common::retry_with_backoff(
            || Doorbell::create(&config.request_doorbell),
            &config.doorbell_backoff,
            "open request doorbell",
        )
        .context("Failed to open request doorbell")?;
        let response = common::retry_with_backoff(
            || Doorbell::create(&config.response_doorbell),
            &config.doorbell_backoff,
            "open response doorbell",
        )
        .context("Failed to open response doorbell")?;
        tracing::info!(
            request = request.name(),
            response = response.name(),
            "Doorbells connected"
        );
        Ok(Doorbells { request, response })
    }

    pub fn registry(&self) -> &BusRegistry {
        self.dispatcher.handler()
    }

    pub fn channel(&self) -> &ControlVmChannel {
        &self.channel
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len() + self.event_backlog.len()
    }

    pub fn outstanding_events(&self) -> usize {
        self.outstanding_events.len()
    }

    /// Rebuild bus and device state from the crash pool. A local chipset
    /// init comes first so the replayed creates have something to land in.
    pub fn replay_crash_pool(&mut self) -> anyhow::Result<usize> {
        let _span = common::span!("crash_replay");
        let saved = self
            .channel
            .crash_replay()
            .context("Failed to read crash pool")?;
        if saved.is_empty() {
            return Ok(0);
        }

        let init = ControlVmMessage::notification(
            ControlVmCommand::ChipsetInit {
                bus_count: self.config.replay_bus_count,
                switch_count: 0,
                features: ChipsetFeatures::empty(),
                platform_number: 0,
            },
            0,
        );
        self.dispatcher.replay(&init, &self.channel);
        for message in &saved {
            let outcome = self.dispatcher.replay(message, &self.channel);
            tracing::info!(id = ?message.id(), handle = message.handle(), ?outcome, "Replayed");
        }
        // State changes are not saved, so replay raises no events
        self.dispatcher.handler_mut().take_events();
        Ok(saved.len())
    }

    fn is_create(message: &ControlVmMessage) -> bool {
        matches!(message.id(), ControlVmId::BusCreate | ControlVmId::DeviceCreate)
    }

    fn send_response(&mut self, raw: RawMessage, report: &mut PollReport) -> Result<(), ChannelError> {
        if let Ok(header) = RawHeader::parse(&raw)
            && !header.header.completion_status.is_success()
        {
            self.metrics.failed.add(1, &[]);
        }
        if !self.backlog.is_empty() {
            self.backlog.push_back(raw);
            return Ok(());
        }
        match self.channel.send_raw(ControlVmQueue::Response, &raw) {
            Ok(()) => {
                report.responses += 1;
                Ok(())
            }
            Err(ChannelError::QueueFull) => {
                self.metrics.deferred_sends.add(1, &[KeyValue::new("queue", "response")]);
                self.backlog.push_back(raw);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn flush_backlog(&mut self, report: &mut PollReport) -> Result<(), ChannelError> {
        while let Some(raw) = self.backlog.front() {
            match self.channel.send_raw(ControlVmQueue::Response, raw) {
                Ok(()) => {
                    self.backlog.pop_front();
                    report.responses += 1;
                }
                Err(ChannelError::QueueFull) => break,
                Err(e) => return Err(e),
            }
        }
        while let Some(event) = self.event_backlog.front() {
            match self.channel.send(ControlVmQueue::Event, event) {
                Ok(()) => {
                    if let Some(event) = self.event_backlog.pop_front() {
                        self.track_event(event);
                    }
                    report.events += 1;
                }
                Err(ChannelError::QueueFull) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn post_events(&mut self, report: &mut PollReport) -> Result<(), ChannelError> {
        for command in self.dispatcher.handler_mut().take_events() {
            let handle = self.next_event_handle;
            self.next_event_handle += 1;
            let event = ControlVmMessage::request(command, handle);
            self.metrics
                .events
                .add(1, &[KeyValue::new("id", format!("{:?}", event.id()))]);

            if !self.event_backlog.is_empty() {
                self.park_event(event);
                continue;
            }
            match self.channel.send(ControlVmQueue::Event, &event) {
                Ok(()) => {
                    self.track_event(event);
                    report.events += 1;
                }
                Err(ChannelError::QueueFull) => {
                    self.metrics.deferred_sends.add(1, &[KeyValue::new("queue", "event")]);
                    self.park_event(event);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn park_event(&mut self, event: ControlVmMessage) {
        if self.event_backlog.len() >= MAX_EVENT_BACKLOG
            && let Some(dropped) = self.event_backlog.pop_front()
        {
            tracing::warn!(
                handle = dropped.handle(),
                id = ?dropped.id(),
                "Event backlog full, dropping oldest"
            );
        }
        self.event_backlog.push_back(event);
    }

    fn track_event(&mut self, event: ControlVmMessage) {
        self.outstanding_events.insert(event.handle(), event);
        if self.outstanding_events.len() > MAX_OUTSTANDING_EVENTS
            && let Some((handle, _)) = self.outstanding_events.pop_first()
        {
            tracing::warn!(handle, "No ack for event, no longer tracking it");
        }
    }

    fn drain_acks(&mut self, report: &mut PollReport) -> Result<(), ChannelError> {
        loop {
            let ack = match self.channel.try_receive(ControlVmQueue::EventAck) {
                Ok(Some(ack)) => ack,
                Ok(None) => return Ok(()),
                Err(ChannelError::Message(e)) => {
                    tracing::warn!(error = %e, "Dropping malformed event ack");
                    continue;
                }
                Err(e) => return Err(e),
            };
            report.acks += 1;
            match self.outstanding_events.remove(&ack.handle()) {
                Some(event) if ack.is_failed() => tracing::warn!(
                    handle = ack.handle(),
                    id = ?event.id(),
                    status = %ack.status(),
                    "Event rejected by command partition"
                ),
                Some(_) => tracing::debug!(handle = ack.handle(), "Event acknowledged"),
                None => tracing::warn!(handle = ack.handle(), "Ack for unknown event"),
            }
        }
    }

    /// One non-blocking pass: flush parked sends, serve up to `max_batch`
    /// requests, post resulting events, then consume event acks.
    ///
    /// No request is taken while anything is still parked, so a command
    /// partition that stops reading leaves its requests queued.
    pub fn poll_once(&mut self) -> Result<PollReport, ChannelError> {
        let mut report = PollReport::default();
        self.flush_backlog(&mut report)?;

        while report.requests < self.config.max_batch
            && self.backlog.is_empty()
            && self.event_backlog.is_empty()
        {
            let Some(raw) = self.channel.try_receive_raw(ControlVmQueue::Request)? else {
                break;
            };
            report.requests += 1;
            self.metrics.requests.add(1, &[]);

            let dispatch = self.dispatcher.handle_raw(&raw, &self.channel);
            let succeeded = dispatch
                .response
                .as_ref()
                .and_then(|r| RawHeader::parse(r).ok())
                .is_none_or(|h| h.header.completion_status.is_success());
            if let Some(request) = dispatch.request.as_ref()
                && Self::is_create(request)
                && succeeded
            {
                self.channel.save_crash_message(request)?;
            }
            if let Some(response) = dispatch.response {
                self.send_response(response, &mut report)?;
            }
        }

        self.post_events(&mut report)?;
        self.drain_acks(&mut report)?;

        if report.responses + report.events > 0 {
            self.ring_response();
        }
        Ok(report)
    }

    fn ring_response(&self) {
        #[cfg(feature = "semaphores")]
        if let Some(doorbells) = &self.doorbells
            && let Err(e) = doorbells.response.ring()
        {
            tracing::warn!(error = %e, "Failed to ring response doorbell");
        }
    }

    fn idle_wait(&self) {
        #[cfg(feature = "semaphores")]
        if let Some(doorbells) = &self.doorbells {
            match doorbells.request.wait_timeout(self.config.poll_interval) {
                Ok(_) => return,
                Err(e) => tracing::warn!(error = %e, "Doorbell wait failed, sleeping instead"),
            }
        }
        thread::sleep(self.config.poll_interval);
    }

    /// Serve until `shutdown` is raised. Errors are logged, never fatal; a
    /// command partition that tears its channel down is waited for again.
    pub fn run(mut self, shutdown: &AtomicBool) -> anyhow::Result<()> {
        tracing::info!(
            path = %self.config.controlvm_path,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_batch = self.config.max_batch,
            "Chipset service starting"
        );

        let mut iterations = 0u64;
        while !shutdown.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(report) if report.is_idle() => self.idle_wait(),
                Ok(report) => tracing::debug!(?report, "Poll"),
                Err(ChannelError::ServerNotReady) | Err(ChannelError::NotAttached(_)) => {
                    tracing::warn!("Command partition went away, re-attaching");
                    let Some(channel) = Self::attach(&self.config, &self.diag, shutdown) else {
                        break;
                    };
                    self.channel = channel;
                    self.backlog.clear();
                    self.event_backlog.clear();
                    self.outstanding_events.clear();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Poll failed");
                    thread::sleep(self.config.poll_interval);
                }
            }

            iterations += 1;
            if iterations.is_multiple_of(1000) {
                let stats = self.dispatcher.stats();
                tracing::debug!(
                    handled = stats.handled,
                    failed = stats.failed,
                    malformed = stats.malformed,
                    buses = self.registry().bus_count(),
                    devices = self.registry().device_count(),
                    backlog = self.backlog_len(),
                    "Chipset status"
                );
            }
        }

        tracing::info!("Chipset service stopping");
        self.channel.detach()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Backoff, Environment};
    use std::time::Duration;
    use visorbus::controlvm::{
        CRASH_POOL_OFFSET, CompletionStatus, ControlVmLayout, CrashSlot, IrqInfo, MESSAGE_SIZE,
        SegmentState,
    };
    use visorbus::{Guid, RecordingDiagnostics, SharedRegion};

    const LAYOUT: ControlVmLayout = ControlVmLayout {
        request_payload_bytes: 2048,
        event_payload_bytes: 512,
    };

    fn config(path: &std::path::Path) -> ChipsetConfig {
        ChipsetConfig {
            environment: Environment::Development,
            controlvm_path: path.to_string_lossy().into_owned(),
            request_doorbell: "/chipset_test_request".into(),
            response_doorbell: "/chipset_test_response".into(),
            poll_interval: Duration::from_millis(1),
            max_batch: 8,
            replay_bus_count: 23,
            use_doorbell: false,
            doorbell_backoff: Backoff::default(),
            otel_endpoint: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        command: ControlVmChannel,
        service: ChipsetService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controlvm");
        let command = ControlVmChannel::create(
            SharedRegion::create(&path, LAYOUT.total_size()).unwrap(),
            &LAYOUT,
            Arc::new(RecordingDiagnostics::new()),
        )
        .unwrap();
        let diag: Arc<dyn DiagnosticSink> = Arc::new(RecordingDiagnostics::new());
        let channel =
            ControlVmChannel::attach(SharedRegion::open(&path).unwrap(), diag.clone()).unwrap();
        let service = ChipsetService::with_channel(config(&path), channel, diag).unwrap();
        Fixture {
            _dir: dir,
            command,
            service,
        }
    }

    fn request(f: &Fixture, command: ControlVmCommand, handle: u64) {
        f.command
            .send(ControlVmQueue::Request, &ControlVmMessage::request(command, handle))
            .unwrap();
    }

    fn responses(f: &Fixture) -> Vec<ControlVmMessage> {
        std::iter::from_fn(|| f.command.try_receive(ControlVmQueue::Response).unwrap()).collect()
    }

    fn init(bus_count: u32) -> ControlVmCommand {
        ControlVmCommand::ChipsetInit {
            bus_count,
            switch_count: 0,
            features: ChipsetFeatures::empty(),
            platform_number: 0,
        }
    }

    fn bus_create(bus_no: u32) -> ControlVmCommand {
        ControlVmCommand::BusCreate {
            bus_no,
            dev_count: 4,
            channel_addr: 0,
            channel_bytes: 0,
            bus_data_type: Guid::NIL,
            bus_instance: Guid::NIL,
        }
    }

    fn device_create(bus_no: u32, dev_no: u32) -> ControlVmCommand {
        ControlVmCommand::DeviceCreate {
            bus_no,
            dev_no,
            channel_addr: 0x10_0000,
            channel_bytes: 0x1000,
            data_type: Guid::NIL,
            dev_instance: Guid::NIL,
            intr: IrqInfo::default(),
        }
    }

    #[test]
    fn test_serves_lifecycle_in_order() {
        let mut f = fixture();
        request(&f, init(2), 1);
        request(&f, bus_create(0), 2);
        request(&f, device_create(0, 1), 3);
        request(&f, ControlVmCommand::ChipsetReady, 4);

        let report = f.service.poll_once().unwrap();
        assert_eq!(report.requests, 4);
        assert_eq!(report.responses, 4);

        let got = responses(&f);
        assert_eq!(got.iter().map(|r| r.handle()).collect::<Vec<_>>(), [1, 2, 3, 4]);
        assert!(got.iter().all(|r| !r.is_failed()));
        assert!(f.service.registry().device(0, 1).is_some());
    }

    #[test]
    fn test_batch_limit_spreads_work_over_polls() {
        let mut f = fixture();
        request(&f, init(2), 0);
        for handle in 1..12 {
            request(&f, ControlVmCommand::ChipsetSelftest { options: 0, test: 0 }, handle);
        }
        assert_eq!(f.service.poll_once().unwrap().requests, 8);
        assert_eq!(f.service.poll_once().unwrap().requests, 4);
        assert!(f.service.poll_once().unwrap().is_idle());
        assert_eq!(responses(&f).len(), 12);
    }

    #[test]
    fn test_full_response_queue_parks_responses() {
        let mut f = fixture();
        // Leave room for only two responses
        let filler = ControlVmMessage::notification(ControlVmCommand::ChipsetReady, 0);
        for _ in 0..61 {
            f.service.channel().send(ControlVmQueue::Response, &filler).unwrap();
        }
        request(&f, init(2), 1);
        for handle in 2..6 {
            request(&f, ControlVmCommand::ChipsetSelftest { options: 0, test: 0 }, handle);
        }

        // The third response is parked and intake stops behind it
        let report = f.service.poll_once().unwrap();
        assert_eq!(report.requests, 3);
        assert_eq!(report.responses, 2);
        assert_eq!(f.service.backlog_len(), 1);

        let drained = responses(&f);
        assert_eq!(drained.len(), 63);

        let report = f.service.poll_once().unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.responses, 3);
        assert_eq!(f.service.backlog_len(), 0);
        let handles: Vec<u64> = responses(&f).iter().map(|r| r.handle()).collect();
        assert_eq!(handles, [3, 4, 5]);
    }

    #[test]
    fn test_stalled_response_queue_holds_requests_back() {
        let mut f = fixture();
        let filler = ControlVmMessage::notification(ControlVmCommand::ChipsetReady, 0);
        for _ in 0..63 {
            f.service.channel().send(ControlVmQueue::Response, &filler).unwrap();
        }
        request(&f, init(2), 0);
        for handle in 1..40 {
            request(&f, ControlVmCommand::ChipsetSelftest { options: 0, test: 0 }, handle);
        }

        for _ in 0..50 {
            f.service.poll_once().unwrap();
            assert!(f.service.backlog_len() <= 1);
        }
        assert_eq!(f.service.dispatcher.stats().handled, 1);
        assert_eq!(f.command.queue(ControlVmQueue::Request).unwrap().len().unwrap(), 39);

        // Once the command side reads again everything gets answered
        let mut answered = responses(&f).len() - 63;
        while answered < 40 {
            f.service.poll_once().unwrap();
            answered += responses(&f).len();
        }
        assert_eq!(f.service.backlog_len(), 0);
    }

    #[test]
    fn test_unacked_events_are_forgotten_beyond_limit() {
        let mut f = fixture();
        request(&f, init(2), 0);
        request(&f, bus_create(0), 1);
        f.service.poll_once().unwrap();
        responses(&f);

        let states = [SegmentState::PAUSED, SegmentState::RUNNING];
        for handle in 0..MAX_OUTSTANDING_EVENTS as u64 + 20 {
            request(
                &f,
                ControlVmCommand::BusChangeState {
                    bus_no: 0,
                    state: states[handle as usize % 2],
                },
                handle + 2,
            );
            f.service.poll_once().unwrap();
            responses(&f);
            // Read the event but never ack it
            while f.command.try_receive(ControlVmQueue::Event).unwrap().is_some() {}
        }
        assert_eq!(f.service.outstanding_events(), MAX_OUTSTANDING_EVENTS);
        assert_eq!(f.service.backlog_len(), 0);
    }

    #[test]
    fn test_state_change_posts_event_and_consumes_ack() {
        let mut f = fixture();
        request(&f, init(2), 1);
        request(&f, bus_create(1), 2);
        request(
            &f,
            ControlVmCommand::BusChangeState {
                bus_no: 1,
                state: SegmentState::PAUSED,
            },
            3,
        );
        let report = f.service.poll_once().unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(f.service.outstanding_events(), 1);

        let event = f.command.try_receive(ControlVmQueue::Event).unwrap().unwrap();
        assert_eq!(
            event.command,
            ControlVmCommand::BusChangeStateEvent {
                bus_no: 1,
                state: SegmentState::PAUSED
            }
        );
        f.command
            .send(
                ControlVmQueue::EventAck,
                &event.response(CompletionStatus::SUCCESS, false),
            )
            .unwrap();

        let report = f.service.poll_once().unwrap();
        assert_eq!(report.acks, 1);
        assert_eq!(f.service.outstanding_events(), 0);
    }

    #[test]
    fn test_successful_creates_reach_the_crash_pool() {
        let mut f = fixture();
        request(&f, init(2), 1);
        request(&f, bus_create(0), 2);
        request(&f, device_create(0, 9), 3); // beyond dev_count, fails
        request(&f, device_create(0, 2), 4);
        f.service.poll_once().unwrap();

        let saved = f.command.crash_replay().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].handle(), 2);
        assert_eq!(saved[1].handle(), 4);
    }

    #[test]
    fn test_restart_replays_crash_pool() {
        let mut f = fixture();
        request(&f, init(2), 1);
        request(&f, bus_create(1), 2);
        request(&f, device_create(1, 3), 3);
        f.service.poll_once().unwrap();
        responses(&f);

        let diag: Arc<dyn DiagnosticSink> = Arc::new(RecordingDiagnostics::new());
        let path = f.service.config.controlvm_path.clone();
        let channel =
            ControlVmChannel::attach(SharedRegion::open(&path).unwrap(), diag.clone()).unwrap();
        let mut restarted =
            ChipsetService::with_channel(config(std::path::Path::new(&path)), channel, diag)
                .unwrap();
        assert_eq!(restarted.replay_crash_pool().unwrap(), 2);

        let device = restarted.registry().device(1, 3).unwrap();
        assert!(device.preserved);
        // Replay answers nobody
        assert!(responses(&f).is_empty());
        assert!(restarted.poll_once().unwrap().is_idle());
    }

    #[test]
    fn test_corrupt_crash_slot_does_not_block_startup() {
        let mut f = fixture();
        request(&f, init(2), 1);
        request(&f, bus_create(1), 2);
        f.service.poll_once().unwrap();
        responses(&f);
        f.command
            .channel()
            .region()
            .write_bytes(
                CRASH_POOL_OFFSET + CrashSlot::DeviceCreate as usize * MESSAGE_SIZE,
                &[0x5a; MESSAGE_SIZE],
            )
            .unwrap();

        let diag: Arc<dyn DiagnosticSink> = Arc::new(RecordingDiagnostics::new());
        let path = f.service.config.controlvm_path.clone();
        let channel =
            ControlVmChannel::attach(SharedRegion::open(&path).unwrap(), diag.clone()).unwrap();
        let mut restarted =
            ChipsetService::with_channel(config(std::path::Path::new(&path)), channel, diag)
                .unwrap();
        assert_eq!(restarted.replay_crash_pool().unwrap(), 1);
        assert!(restarted.registry().bus(1).is_some());
        assert_eq!(restarted.channel().crash_message(1).unwrap(), None);
    }

    #[test]
    fn test_malformed_request_gets_failure_response() {
        let mut f = fixture();
        let mut raw = ControlVmMessage::request(init(2), 5).encode();
        raw[0..4].copy_from_slice(&0x0bad_u32.to_ne_bytes());
        f.command.send_raw(ControlVmQueue::Request, &raw).unwrap();

        f.service.poll_once().unwrap();
        let raw = f.command.try_receive_raw(ControlVmQueue::Response).unwrap().unwrap();
        let header = RawHeader::parse(&raw).unwrap();
        assert_eq!(header.header.message_handle, 5);
        assert_eq!(header.header.completion_status, CompletionStatus::ID_UNKNOWN);
    }

    #[test]
    fn test_detached_client_reports_not_attached() {
        let mut f = fixture();
        f.service.channel.detach().unwrap();
        assert!(matches!(
            f.service.poll_once(),
            Err(ChannelError::NotAttached(_))
        ));
    }
}
