//! Command-list and fence plumbing shared by every GPU consumer.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    hal::{Api, CommandList as _, Device as _, Fence as _, Queue as _},
};

/// One queue, one command list and one fence. Fence values only grow.
pub struct Commands<A: Api> {
    queue: A::Queue,
    list: A::CommandList,
    fence: A::Fence,
    fence_value: u64,
    timeout: Duration,
}

impl<A: Api> Commands<A> {
    pub fn new(device: &A::Device, queue: A::Queue, timeout: Duration) -> Result<Self> {
        Ok(Self {
            queue,
            list: device.create_command_list()?,
            fence: device.create_fence()?,
            fence_value: 0,
            timeout,
        })
    }

    /// Reset the list so it can be recorded into. All work recorded into it
    /// before must have retired.
    pub fn reset_command_list(&mut self) -> Result<&mut A::CommandList> {
        self.list.reset()?;
        Ok(&mut self.list)
    }

    /// Close the list and submit it.
    pub fn execute_command_list(&mut self) -> Result<()> {
        self.list.close()?;
        self.queue.execute(&self.list)
    }

    /// Signal the next fence value on the queue and return it.
    pub fn signal(&mut self) -> Result<u64> {
        self.fence_value += 1;
        self.queue.signal(&self.fence, self.fence_value)?;
        Ok(self.fence_value)
    }

    pub fn wait_for_fence_value(&self, value: u64) -> Result<()> {
        if self.fence.completed_value() >= value {
            return Ok(());
        }
        if self.fence.wait(value, self.timeout)? {
            Ok(())
        } else {
            Err(Error::FenceTimeout {
                value,
                completed: self.fence.completed_value(),
            })
        }
    }

    /// Block until everything submitted so far has retired.
    pub fn flush(&mut self) -> Result<()> {
        let value = self.signal()?;
        self.wait_for_fence_value(value)
    }

    /// Execute the current list and wait for it.
    pub fn submit_and_wait(&mut self) -> Result<()> {
        self.execute_command_list()?;
        self.flush()
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }
}

/// Fence timeout from a millisecond count; `0` waits forever.
pub fn fence_timeout(millis: u64) -> Duration {
    if millis == 0 {
        Duration::MAX
    } else {
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless;

    fn commands() -> (headless::Device, Commands<headless::Api>) {
        let device = headless::Device::new();
        let queue = device.create_queue();
        let commands = Commands::new(&device, queue, Duration::from_millis(10)).unwrap();
        (device, commands)
    }

    #[test]
    fn fence_values_increase() {
        let (_device, mut commands) = commands();
        assert_eq!(commands.signal().unwrap(), 1);
        assert_eq!(commands.signal().unwrap(), 2);
        commands.flush().unwrap();
        assert_eq!(commands.fence_value(), 3);
    }

    #[test]
    fn waiting_past_the_last_signal_times_out() {
        let (_device, mut commands) = commands();
        commands.flush().unwrap();
        let err = commands.wait_for_fence_value(5).unwrap_err();
        assert!(matches!(
            err,
            Error::FenceTimeout {
                value: 5,
                completed: 1
            }
        ));
    }

    #[test]
    fn submit_executes_and_waits() {
        let (device, mut commands) = commands();
        commands.reset_command_list().unwrap();
        commands.submit_and_wait().unwrap();
        assert_eq!(device.submission_count(), 1);
        // closed lists cannot be closed again
        assert!(commands.execute_command_list().is_err());
    }

    #[test]
    fn zero_timeout_means_forever() {
        assert_eq!(fence_timeout(0), Duration::MAX);
        assert_eq!(fence_timeout(250), Duration::from_millis(250));
    }
}
