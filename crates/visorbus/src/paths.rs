//! Default shared-memory locations for the control channel and its doorbells.
//!
//! Server and client must agree on these; both the chipset service and the
//! command tool fall back to them when no override is configured.

/// Backing file for the ControlVM channel.
pub const CONTROLVM_CHANNEL_PATH: &str = "/dev/shm/visorbus_controlvm";

/// Posted by the command side after pushing onto a server-bound queue.
pub const SEMAPHORE_CONTROLVM_REQUEST: &str = "/visorbus_controlvm_request";

/// Posted by the chipset side after pushing a response or event.
pub const SEMAPHORE_CONTROLVM_RESPONSE: &str = "/visorbus_controlvm_response";

/// Payload space reserved behind the fixed part of a freshly created channel.
pub const DEFAULT_PAYLOAD_SIZE: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_path_is_absolute() {
        assert!(CONTROLVM_CHANNEL_PATH.starts_with('/'));
    }

    #[test]
    fn test_semaphore_names_are_posix_names() {
        for name in [SEMAPHORE_CONTROLVM_REQUEST, SEMAPHORE_CONTROLVM_RESPONSE] {
            assert!(name.starts_with('/'));
            assert!(!name[1..].contains('/'));
        }
    }
}
