//! Diagnostic post codes.
//!
//! A post code packs where and what into one `u64` so a hypervisor-side
//! log can store it without parsing:
//!
//! ```text
//! 0xAABBBCCCDDDDEEEE
//!   AA   module id
//!   BBB  event id
//!   CCC  line (or sub-reason)
//!   DDDD first detail word
//!   EEEE second detail word
//! ```

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

pub trait DiagnosticSink: Send + Sync {
    fn log_diagnostic(&self, code: u64, severity: Severity);
}

/// Module ids (the `AA` byte).
pub mod module {
    pub const CHANNEL: u8 = 0x01;
    pub const SIGNAL_QUEUE: u8 = 0x02;
    pub const ATTACHMENT: u8 = 0x03;
    pub const CONTROLVM: u8 = 0x04;
    pub const CHIPSET: u8 = 0x05;
}

/// Event ids (the `BBB` field).
pub mod event {
    pub const VALIDATION_FAILED: u16 = 0x001;
    pub const ILLEGAL_TRANSITION: u16 = 0x010;
    pub const TRANSITION_LOST: u16 = 0x011;
    pub const QUEUE_CORRUPT: u16 = 0x020;
    pub const MALFORMED_MESSAGE: u16 = 0x030;
    pub const UNKNOWN_MESSAGE: u16 = 0x031;
    pub const CRASH_REPLAY: u16 = 0x040;
    pub const CRASH_SLOT_CORRUPT: u16 = 0x041;
    pub const CHIPSET_INIT: u16 = 0x100;
    pub const BUS_CREATE: u16 = 0x110;
    pub const BUS_DESTROY: u16 = 0x111;
    pub const DEVICE_CREATE: u16 = 0x120;
    pub const DEVICE_DESTROY: u16 = 0x121;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PostCode {
    pub module: u8,
    pub event: u16,
    pub line: u16,
    pub a: u16,
    pub b: u16,
}

impl PostCode {
    pub const fn new(module: u8, event: u16) -> Self {
        Self {
            module,
            event,
            line: 0,
            a: 0,
            b: 0,
        }
    }

    pub const fn with_line(mut self, line: u16) -> Self {
        self.line = line;
        self
    }

    pub const fn with_detail(mut self, a: u16, b: u16) -> Self {
        self.a = a;
        self.b = b;
        self
    }

    /// Event and line are 12-bit fields; excess bits are dropped.
    pub const fn encode(&self) -> u64 {
        ((self.module as u64) << 56)
            | (((self.event as u64) & 0xfff) << 44)
            | (((self.line as u64) & 0xfff) << 32)
            | ((self.a as u64) << 16)
            | (self.b as u64)
    }

    pub const fn decode(code: u64) -> Self {
        Self {
            module: (code >> 56) as u8,
            event: ((code >> 44) & 0xfff) as u16,
            line: ((code >> 32) & 0xfff) as u16,
            a: (code >> 16) as u16,
            b: code as u16,
        }
    }
}

pub(crate) fn post(sink: &dyn DiagnosticSink, code: PostCode, severity: Severity) {
    sink.log_diagnostic(code.encode(), severity);
}

/// Forwards post codes to `tracing`, the default for hosted builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn log_diagnostic(&self, code: u64, severity: Severity) {
        let code = format!("{code:#018x}");
        match severity {
            Severity::Error => tracing::error!(post_code = %code, "Diagnostic"),
            Severity::Warning => tracing::warn!(post_code = %code, "Diagnostic"),
            Severity::Info => tracing::info!(post_code = %code, "Diagnostic"),
        }
    }
}

/// Keeps every post code in memory; used by tests and the status command.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    records: Mutex<Vec<(u64, Severity)>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(u64, Severity)> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn count_event(&self, event: u16) -> usize {
        self.records()
            .iter()
            .filter(|(code, _)| PostCode::decode(*code).event == event)
            .count()
    }
}

impl DiagnosticSink for RecordingDiagnostics {
    fn log_diagnostic(&self, code: u64, severity: Severity) {
        if let Ok(mut records) = self.records.lock() {
            records.push((code, severity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let code = PostCode::new(0xAA, 0xBBB)
            .with_line(0xCCC)
            .with_detail(0xDDDD, 0xEEEE);
        assert_eq!(code.encode(), 0xAABB_BCCC_DDDD_EEEE);
        assert_eq!(PostCode::decode(0xAABB_BCCC_DDDD_EEEE), code);
    }

    #[test]
    fn test_oversized_event_is_masked() {
        let code = PostCode::new(module::CHANNEL, 0x1fff);
        assert_eq!(PostCode::decode(code.encode()).event, 0xfff);
        assert_eq!(PostCode::decode(code.encode()).module, module::CHANNEL);
    }

    #[test]
    fn test_recording_sink_counts_events() {
        let sink = RecordingDiagnostics::new();
        post(
            &sink,
            PostCode::new(module::ATTACHMENT, event::ILLEGAL_TRANSITION),
            Severity::Warning,
        );
        post(
            &sink,
            PostCode::new(module::CHANNEL, event::VALIDATION_FAILED),
            Severity::Error,
        );
        post(
            &sink,
            PostCode::new(module::ATTACHMENT, event::ILLEGAL_TRANSITION).with_line(2),
            Severity::Warning,
        );

        assert_eq!(sink.records().len(), 3);
        assert_eq!(sink.count_event(event::ILLEGAL_TRANSITION), 2);
        assert_eq!(sink.records()[1].1, Severity::Error);
    }
}
