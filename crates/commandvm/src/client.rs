use anyhow::Context;
use common::poll_until;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use visorbus::controlvm::{
    CompletionStatus, ControlVmChannel, ControlVmCommand, ControlVmMessage, ControlVmPayload,
    ControlVmQueue,
};
use visorbus::{ChannelError, RetryConfig};

#[cfg(feature = "semaphores")]
use visorbus::Doorbell;

/// The final answer to one request, plus what was seen while waiting for it.
#[derive(Debug)]
pub struct Reply {
    pub response: ControlVmMessage,
    pub partials: usize,
    pub events: Vec<ControlVmMessage>,
}

/// Command-partition end of the ControlVM channel: sends requests and
/// correlates responses by handle.
pub struct CommandClient {
    channel: ControlVmChannel,
    next_handle: u64,
    timeout: Duration,
    poll_interval: Duration,
    retry: RetryConfig,
    #[cfg(feature = "semaphores")]
    doorbell: Option<Doorbell>,
}

/// Seed handles from the clock so two invocations never share one.
fn initial_handle() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

impl CommandClient {
    pub fn new(channel: ControlVmChannel, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            channel,
            next_handle: initial_handle(),
            timeout,
            poll_interval,
            retry: RetryConfig::default(),
            #[cfg(feature = "semaphores")]
            doorbell: None,
        }
    }

    /// Ring `name` after every request. A missing semaphore only means the
    /// chipset polls, so failing to open it is not an error.
    #[cfg(feature = "semaphores")]
    pub fn with_doorbell(mut self, name: &str) -> Self {
        match Doorbell::open(name) {
            Ok(doorbell) => self.doorbell = Some(doorbell),
            Err(e) => tracing::debug!(error = %e, "No request doorbell, chipset will poll"),
        }
        self
    }

    fn ring(&self) {
        #[cfg(feature = "semaphores")]
        if let Some(doorbell) = &self.doorbell
            && let Err(e) = doorbell.ring()
        {
            tracing::warn!(error = %e, "Failed to ring request doorbell");
        }
    }

    /// Send `command` with a fresh handle and wait for its final response.
    pub fn request(
        &mut self,
        command: ControlVmCommand,
        payload: Option<&ControlVmPayload>,
    ) -> anyhow::Result<Reply> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);

        let mut message = ControlVmMessage::request(command, handle);
        if let Some(payload) = payload {
            let at = self
                .channel
                .write_payload(ControlVmQueue::Request, 0, payload)
                .context("Failed to write request payload")?;
            message = message.with_payload_ref(at);
        }

        self.channel
            .send_with_retry(ControlVmQueue::Request, &message, &self.retry)
            .with_context(|| format!("Failed to send {:?}", message.id()))?;
        self.ring();
        tracing::debug!(id = ?message.id(), handle, "Request sent");

        let mut partials = 0;
        let mut events = Vec::new();
        let response = poll_until(
            || self.receive_for(handle, &mut partials, &mut events),
            self.timeout,
            self.poll_interval,
        )?;
        let Some(response) = response else {
            anyhow::bail!(
                "No response to {:?} (handle {handle}) within {:?}",
                message.id(),
                self.timeout
            );
        };

        Ok(Reply {
            response,
            partials,
            events,
        })
    }

    fn receive_for(
        &self,
        handle: u64,
        partials: &mut usize,
        events: &mut Vec<ControlVmMessage>,
    ) -> Result<Option<ControlVmMessage>, ChannelError> {
        events.extend(self.acknowledge_events()?);

        loop {
            let response = match self.channel.try_receive(ControlVmQueue::Response) {
                Ok(Some(response)) => response,
                Ok(None) => return Ok(None),
                Err(ChannelError::Message(e)) => {
                    tracing::warn!(error = %e, "Skipping undecodable response");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if response.handle() != handle {
                tracing::warn!(
                    handle = response.handle(),
                    expected = handle,
                    "Stray response"
                );
                continue;
            }
            if response.is_partial() {
                *partials += 1;
                tracing::info!(handle, status = %response.status(), "Partial completion");
                continue;
            }
            return Ok(Some(response));
        }
    }

    /// Drain the event queue, acking each event on the ack queue.
    pub fn acknowledge_events(&self) -> Result<Vec<ControlVmMessage>, ChannelError> {
        let mut seen = Vec::new();
        loop {
            let event = match self.channel.try_receive(ControlVmQueue::Event) {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(seen),
                Err(ChannelError::Message(e)) => {
                    tracing::warn!(error = %e, "Skipping undecodable event");
                    continue;
                }
                Err(e) => return Err(e),
            };
            tracing::info!(id = ?event.id(), handle = event.handle(), command = ?event.command, "Event");
            if event.response_expected() {
                let ack = event.response(CompletionStatus::SUCCESS, false);
                self.channel
                    .send_with_retry(ControlVmQueue::EventAck, &ack, &self.retry)?;
            }
            seen.push(event);
        }
    }
}
