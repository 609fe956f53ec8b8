use super::status::CompletionStatus;
use super::wire::{PARAMETERS_HEADER_SIZE, ParametersHeaderWire};
use crate::guid::Guid;
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadField {
    Connection,
    Initiator,
    Target,
    Client,
    Name,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload of {len} bytes is shorter than its {needed}-byte header")]
    Truncated { len: usize, needed: usize },

    #[error("payload declares {declared} bytes but {actual} were transferred")]
    TotalLengthMismatch { declared: u32, actual: usize },

    #[error("payload header_length {0} is invalid")]
    HeaderLength(u32),

    #[error("{field:?} string at {offset}+{length} lies outside the {total}-byte payload")]
    FieldOutOfBounds {
        field: PayloadField,
        offset: u32,
        length: u32,
        total: u32,
    },

    #[error("{0:?} string is not valid UTF-8")]
    InvalidUtf8(PayloadField),

    #[error("payload of {len} bytes exceeds the {capacity}-byte payload area")]
    PayloadTooLarge { len: usize, capacity: usize },
}

impl PayloadError {
    pub fn status(&self) -> CompletionStatus {
        let field = match self {
            PayloadError::FieldOutOfBounds { field, .. } | PayloadError::InvalidUtf8(field) => {
                *field
            }
            _ => return CompletionStatus::PAYLOAD_INVALID,
        };
        match field {
            PayloadField::Initiator => CompletionStatus::INITIATOR_PARAMETER_INVALID,
            PayloadField::Target => CompletionStatus::TARGET_PARAMETER_INVALID,
            PayloadField::Client => CompletionStatus::CLIENT_PARAMETER_INVALID,
            PayloadField::Connection | PayloadField::Name => CompletionStatus::PAYLOAD_INVALID,
        }
    }
}

/// Parameter block referenced by a message's payload offset: a fixed header
/// followed by UTF-8 strings it points into.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlVmPayload {
    pub id: Guid,
    pub revision: u32,
    pub connection: Option<String>,
    pub initiator: Option<String>,
    pub target: Option<String>,
    pub client: Option<String>,
    pub name: Option<String>,
}

impl ControlVmPayload {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    fn fields(&self) -> [(PayloadField, Option<&str>); 5] {
        [
            (PayloadField::Connection, self.connection.as_deref()),
            (PayloadField::Initiator, self.initiator.as_deref()),
            (PayloadField::Target, self.target.as_deref()),
            (PayloadField::Client, self.client.as_deref()),
            (PayloadField::Name, self.name.as_deref()),
        ]
    }

    /// Lay out header and strings back to back. `total_length` is the
    /// returned length, which is what goes in `payload_bytes`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut spans = [(0u32, 0u32); 5];
        for (span, (_, value)) in spans.iter_mut().zip(self.fields()) {
            if let Some(s) = value {
                *span = ((PARAMETERS_HEADER_SIZE + body.len()) as u32, s.len() as u32);
                body.extend_from_slice(s.as_bytes());
            }
        }

        let header = ParametersHeaderWire {
            total_length: ((PARAMETERS_HEADER_SIZE + body.len()) as u32).into(),
            header_length: (PARAMETERS_HEADER_SIZE as u32).into(),
            connection_offset: spans[0].0.into(),
            connection_length: spans[0].1.into(),
            initiator_offset: spans[1].0.into(),
            initiator_length: spans[1].1.into(),
            target_offset: spans[2].0.into(),
            target_length: spans[2].1.into(),
            client_offset: spans[3].0.into(),
            client_length: spans[3].1.into(),
            name_offset: spans[4].0.into(),
            name_length: spans[4].1.into(),
            id: self.id,
            revision: self.revision.into(),
            reserved: 0.into(),
        };

        let mut out = Vec::with_capacity(PARAMETERS_HEADER_SIZE + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse the `payload_bytes` bytes copied out of the payload area.
    pub fn parse(bytes: &[u8]) -> Result<Self, PayloadError> {
        let (header, _) =
            ParametersHeaderWire::read_from_prefix(bytes).map_err(|_| PayloadError::Truncated {
                len: bytes.len(),
                needed: PARAMETERS_HEADER_SIZE,
            })?;

        let total = header.total_length.get();
        if total as usize != bytes.len() {
            return Err(PayloadError::TotalLengthMismatch {
                declared: total,
                actual: bytes.len(),
            });
        }
        let header_length = header.header_length.get();
        if (header_length as usize) < PARAMETERS_HEADER_SIZE || header_length > total {
            return Err(PayloadError::HeaderLength(header_length));
        }

        let field = |field: PayloadField, offset: u32, length: u32| -> Result<Option<String>, PayloadError> {
            if length == 0 {
                return Ok(None);
            }
            let out_of_bounds = PayloadError::FieldOutOfBounds {
                field,
                offset,
                length,
                total,
            };
            if offset < header_length {
                return Err(out_of_bounds);
            }
            let end = offset.checked_add(length).ok_or(out_of_bounds.clone())?;
            if end > total {
                return Err(out_of_bounds);
            }
            let raw = &bytes[offset as usize..end as usize];
            // Peers may include a terminating NUL in the length
            let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
            std::str::from_utf8(raw)
                .map(|s| Some(s.to_string()))
                .map_err(|_| PayloadError::InvalidUtf8(field))
        };

        Ok(Self {
            id: header.id,
            revision: header.revision.get(),
            connection: field(
                PayloadField::Connection,
                header.connection_offset.get(),
                header.connection_length.get(),
            )?,
            initiator: field(
                PayloadField::Initiator,
                header.initiator_offset.get(),
                header.initiator_length.get(),
            )?,
            target: field(
                PayloadField::Target,
                header.target_offset.get(),
                header.target_length.get(),
            )?,
            client: field(
                PayloadField::Client,
                header.client_offset.get(),
                header.client_length.get(),
            )?,
            name: field(
                PayloadField::Name,
                header.name_offset.get(),
                header.name_length.get(),
            )?,
        })
    }
}
