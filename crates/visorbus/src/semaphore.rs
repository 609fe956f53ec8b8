use crate::errors::ChannelError;
use nix::errno::Errno;
use nix::libc;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_gettime};
use std::ffi::CString;
use std::time::Duration;

/// Named POSIX semaphore used as the "work pending" interrupt for a channel.
///
/// Queues are polled regardless; the doorbell only shortens the wait between
/// polls. One post per pushed signal is enough, extra posts are harmless.
pub struct Doorbell {
    sem: *mut libc::sem_t,
    name: String,
}

unsafe impl Send for Doorbell {}
unsafe impl Sync for Doorbell {}

fn c_name(name: &str) -> Result<CString, ChannelError> {
    CString::new(name).map_err(|_| ChannelError::SemaphoreError(format!("invalid name {name:?}")))
}

fn last_error(op: &str, name: &str) -> ChannelError {
    ChannelError::SemaphoreError(format!("{op} {name}: {}", Errno::last()))
}

impl Doorbell {
    /// Open the doorbell, creating it with a zero count if it does not exist.
    pub fn create(name: &str) -> Result<Self, ChannelError> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), libc::O_CREAT, 0o600, 0) };
        if sem == libc::SEM_FAILED {
            return Err(last_error("sem_open", name));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    pub fn open(name: &str) -> Result<Self, ChannelError> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(last_error("sem_open", name));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> Result<(), ChannelError> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(last_error("sem_post", &self.name));
        }
        Ok(())
    }

    /// Consume one ring if available. Never blocks.
    pub fn try_wait(&self) -> Result<bool, ChannelError> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EAGAIN => Ok(false),
            _ => Err(last_error("sem_trywait", &self.name)),
        }
    }

    /// Block until rung or `timeout` elapses. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let now = clock_gettime(ClockId::CLOCK_REALTIME)
            .map_err(|e| ChannelError::SemaphoreError(format!("clock_gettime: {e}")))?;
        let deadline = now + TimeSpec::from_duration(timeout);

        loop {
            if unsafe { libc::sem_timedwait(self.sem, deadline.as_ref()) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::ETIMEDOUT => return Ok(false),
                Errno::EINTR => continue,
                _ => return Err(last_error("sem_timedwait", &self.name)),
            }
        }
    }

    /// Collapse any backlog of rings into one; the consumer drains queues fully.
    pub fn drain(&self) -> Result<u32, ChannelError> {
        let mut drained = 0;
        while self.try_wait()? {
            drained += 1;
        }
        Ok(drained)
    }

    pub fn unlink(name: &str) -> Result<(), ChannelError> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } != 0 {
            return Err(last_error("sem_unlink", name));
        }
        Ok(())
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn unique_name(tag: &str) -> String {
        format!("/visorbus_test_{tag}_{}", std::process::id())
    }

    #[test]
    fn test_ring_then_wait() {
        let name = unique_name("ring");
        let bell = Doorbell::create(&name).unwrap();

        assert!(!bell.try_wait().unwrap());
        bell.ring().unwrap();
        assert!(bell.wait_timeout(Duration::from_millis(100)).unwrap());

        Doorbell::unlink(&name).unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let name = unique_name("timeout");
        let bell = Doorbell::create(&name).unwrap();

        let start = Instant::now();
        assert!(!bell.wait_timeout(Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(15));

        Doorbell::unlink(&name).unwrap();
    }

    #[test]
    fn test_drain_collapses_backlog() {
        let name = unique_name("drain");
        let producer = Doorbell::create(&name).unwrap();
        let consumer = Doorbell::open(&name).unwrap();

        for _ in 0..3 {
            producer.ring().unwrap();
        }
        assert_eq!(consumer.drain().unwrap(), 3);
        assert!(!consumer.try_wait().unwrap());

        Doorbell::unlink(&name).unwrap();
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(matches!(
            Doorbell::create("/bad\0name"),
            Err(ChannelError::SemaphoreError(_))
        ));
    }
}
