use crate::attachment::{ClientAttachment, ClientState, ServerState};
use crate::diag::{self, DiagnosticSink, PostCode, Severity, TracingDiagnostics};
use crate::errors::ChannelError;
use crate::header::{self, CHANNEL_HEADER_SIZE, ChannelExpectation, ChannelHeader};
use crate::region::SharedRegion;
use crate::signal_queue::{SIGNAL_QUEUE_HEADER_SIZE, SignalQueue};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the channel: writes the header and the server state.
    Server,
    /// Uses the channel after attaching; owns the client state.
    Client,
}

/// Both state axes as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    pub server: ServerState,
    pub client: ClientState,
}

/// A validated channel mapped into this partition.
pub struct Channel {
    region: SharedRegion,
    role: Role,
    name: &'static str,
    attachment: ClientAttachment,
    diag: Arc<dyn DiagnosticSink>,
}

impl Channel {
    /// Lay down a fresh header over `region`. The server state stays
    /// `Uninitialized` until [`Channel::mark_ready`].
    pub fn create(
        region: SharedRegion,
        name: &'static str,
        header: &ChannelHeader,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ChannelError> {
        if (header.size.get() as usize) > region.len() {
            return Err(ChannelError::OutOfBounds {
                offset: 0,
                len: header.size.get() as usize,
                region_len: region.len(),
            });
        }
        header::check_structure(header, name)?;
        region.write(0, header)?;

        tracing::info!(
            channel = name,
            channel_type = %header.channel_type,
            size = header.size.get(),
            "Channel created"
        );
        Ok(Self {
            region,
            role: Role::Server,
            name,
            attachment: ClientAttachment::new(diag.clone()),
            diag,
        })
    }

    /// Re-open a channel this partition serves, e.g. after a restart.
    pub fn open_server(
        region: SharedRegion,
        expected: &ChannelExpectation,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ChannelError> {
        let channel = Self {
            region,
            role: Role::Server,
            name: expected.name,
            attachment: ClientAttachment::new(diag.clone()),
            diag,
        };
        channel.validate(expected)?;
        Ok(channel)
    }

    /// `attach(channel)`: validate, require a ready server, then move the
    /// client axis to `Attached`.
    ///
    /// A client that is already attached (`Attached`, `Busy`, `Owned`) keeps
    /// its state; a `Busy` left over from a previous incarnation is released.
    pub fn attach(
        region: SharedRegion,
        expected: &ChannelExpectation,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ChannelError> {
        let mut channel = Self {
            region,
            role: Role::Client,
            name: expected.name,
            attachment: ClientAttachment::new(diag.clone()),
            diag,
        };
        channel.validate(expected)?;

        if ClientAttachment::server_state(&channel.region)? != ServerState::Ready {
            tracing::warn!(channel = channel.name, "Server not ready, refusing attach");
            return Err(ChannelError::ServerNotReady);
        }

        match ClientAttachment::client_state(&channel.region)? {
            ClientState::Attached | ClientState::Owned => {}
            ClientState::Busy => channel.attachment.release(&channel.region)?,
            ClientState::Detached | ClientState::Attaching | ClientState::Disabled => channel
                .attachment
                .transition(&channel.region, ClientState::Attached)?,
        }

        // The server may have been torn down while we transitioned
        channel.ensure_usable()?;
        tracing::info!(channel = channel.name, "Attached");
        Ok(channel)
    }

    /// Like [`Channel::attach`] with the default tracing diagnostics.
    pub fn attach_default(
        region: SharedRegion,
        expected: &ChannelExpectation,
    ) -> Result<Self, ChannelError> {
        Self::attach(region, expected, Arc::new(TracingDiagnostics))
    }

    fn validate(&self, expected: &ChannelExpectation) -> Result<(), ChannelError> {
        if self.region.len() < CHANNEL_HEADER_SIZE {
            return Err(ChannelError::OutOfBounds {
                offset: 0,
                len: CHANNEL_HEADER_SIZE,
                region_len: self.region.len(),
            });
        }
        let hdr = self.header()?;
        let result = header::validate(&hdr, expected)
            .and_then(|()| header::check_structure(&hdr, expected.name));
        if let Err(err) = result {
            diag::post(
                self.diag.as_ref(),
                PostCode::new(diag::module::CHANNEL, diag::event::VALIDATION_FAILED)
                    .with_line(err.field_code()),
                Severity::Error,
            );
            return Err(err.into());
        }
        if hdr.size.get() as usize > self.region.len() {
            return Err(ChannelError::OutOfBounds {
                offset: 0,
                len: hdr.size.get() as usize,
                region_len: self.region.len(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub(crate) fn diag(&self) -> &Arc<dyn DiagnosticSink> {
        &self.diag
    }

    pub fn header(&self) -> Result<ChannelHeader, ChannelError> {
        self.region.read(0)
    }

    pub fn mark_ready(&self) -> Result<(), ChannelError> {
        ClientAttachment::set_server_state(&self.region, ServerState::Ready)?;
        tracing::info!(channel = self.name, "Server ready");
        Ok(())
    }

    pub fn mark_uninitialized(&self) -> Result<(), ChannelError> {
        ClientAttachment::set_server_state(&self.region, ServerState::Uninitialized)
    }

    /// `current_state(channel)`.
    pub fn current_state(&self) -> Result<ChannelState, ChannelError> {
        Ok(ChannelState {
            server: ClientAttachment::server_state(&self.region)?,
            client: ClientAttachment::client_state(&self.region)?,
        })
    }

    /// Clients may only touch content while the server is ready and they
    /// are attached. Servers always may.
    pub fn ensure_usable(&self) -> Result<(), ChannelError> {
        if self.role == Role::Server {
            return Ok(());
        }
        let state = self.current_state()?;
        if state.server != ServerState::Ready {
            return Err(ChannelError::ServerNotReady);
        }
        if !state.client.is_attached() {
            return Err(ChannelError::NotAttached(state.client));
        }
        Ok(())
    }

    pub fn transition(&mut self, new: ClientState) -> Result<(), ChannelError> {
        self.attachment.transition(&self.region, new)
    }

    pub fn acquire(&mut self) -> Result<(), ChannelError> {
        self.attachment.acquire(&self.region)
    }

    pub fn release(&mut self) -> Result<(), ChannelError> {
        self.attachment.release(&self.region)
    }

    pub fn reset_client(&mut self) -> Result<(), ChannelError> {
        self.attachment.reset(&self.region)
    }

    /// Give up the channel: `Attached`/`Attaching` → `Detached`.
    pub fn detach(&mut self) -> Result<(), ChannelError> {
        if ClientAttachment::client_state(&self.region)? == ClientState::Busy {
            self.attachment.release(&self.region)?;
        }
        self.attachment.transition(&self.region, ClientState::Detached)?;
        tracing::info!(channel = self.name, "Detached");
        Ok(())
    }

    /// Offset of queue `index`'s header: `ch_space_offset + index * 128`.
    pub fn queue_offset(&self, index: u32) -> Result<usize, ChannelError> {
        let base = self.header()?.ch_space_offset.get() as usize;
        Ok(base + index as usize * SIGNAL_QUEUE_HEADER_SIZE)
    }

    pub fn signal_queue(&self, index: u32, signal_size: u32) -> Result<SignalQueue<'_>, ChannelError> {
        SignalQueue::open(&self.region, self.queue_offset(index)?, signal_size)
    }

    /// `send(queue, message)` for a raw slot. The signal must be exactly the
    /// queue's slot size.
    pub fn send(&self, index: u32, signal: &[u8]) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        self.signal_queue(index, signal.len() as u32)?.push(signal)
    }

    /// `try_receive(queue)` for a raw slot.
    pub fn try_receive(&self, index: u32, signal_size: u32) -> Result<Option<Vec<u8>>, ChannelError> {
        self.ensure_usable()?;
        self.signal_queue(index, signal_size)?.pop()
    }
}
