//! Per-client ring of reliable server commands
//!
//! Commands are numbered from 1 and stored at `sequence % capacity`. Every
//! outgoing message repeats all commands the client has not acknowledged, so
//! the ring can never hold more unacknowledged commands than its capacity.

use shared::MAX_RELIABLE_COMMANDS;
use thiserror::Error;

/// Failures of the reliable command ring
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableError {
    #[error("reliable command overflow (sequence {sequence}, acknowledged {acknowledge})")]
    Overflow { sequence: i32, acknowledge: i32 },

    #[error("acknowledge {acknowledge} outside window ending at {sequence}")]
    BadAcknowledge { acknowledge: i32, sequence: i32 },
}

/// Outbound reliable server commands of one client, with the client's
/// acknowledgement
#[derive(Debug, Clone)]
pub struct ReliableChannel {
    commands: Vec<String>,
    sequence: i32,
    acknowledge: i32,
}

impl Default for ReliableChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableChannel {
    /// Creates an empty ring; the first command gets sequence 1
    pub fn new() -> Self {
        Self {
            commands: vec![String::new(); MAX_RELIABLE_COMMANDS],
            sequence: 0,
            acknowledge: 0,
        }
    }

    /// Commands the ring holds before it overflows
    pub fn capacity(&self) -> usize {
        self.commands.len()
    }

    /// Sequence number of the newest command
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    /// Newest command the client reported as executed
    pub fn acknowledge(&self) -> i32 {
        self.acknowledge
    }

    /// Commands sent but not yet acknowledged
    pub fn unacknowledged(&self) -> usize {
        (self.sequence - self.acknowledge).max(0) as usize
    }

    /// Queues a command and returns its sequence number
    ///
    /// Fails without modifying the ring when the command would overwrite one
    /// the client has not acknowledged yet.
    pub fn push(&mut self, text: &str) -> Result<i32, ReliableError> {
        let next = self.sequence + 1;
        if next - self.acknowledge > self.capacity() as i32 {
            return Err(ReliableError::Overflow {
                sequence: next,
                acknowledge: self.acknowledge,
            });
        }
        self.store(next, text);
        Ok(next)
    }

    /// Queues a command even if it overwrites unacknowledged history
    ///
    /// Only used for the final `disconnect` of a connection that is being
    /// dropped; nothing is sent on the slot afterwards except retransmissions.
    pub fn force_push(&mut self, text: &str) -> i32 {
        let next = self.sequence + 1;
        self.store(next, text);
        next
    }

    /// Applies the client's "last command executed" report
    ///
    /// Values outside `[sequence - capacity, sequence]` can only come from a
    /// corrupt or forged packet.
    pub fn set_acknowledge(&mut self, acknowledge: i32) -> Result<(), ReliableError> {
        let low = self.sequence - self.capacity() as i32;
        if acknowledge < low || acknowledge > self.sequence {
            return Err(ReliableError::BadAcknowledge {
                acknowledge,
                sequence: self.sequence,
            });
        }
        self.acknowledge = acknowledge;
        Ok(())
    }

    /// Text stored for `sequence`, which may have been overwritten
    pub fn get(&self, sequence: i32) -> &str {
        &self.commands[self.index(sequence)]
    }

    /// Every command after the acknowledged one, oldest first
    pub fn pending(&self) -> impl Iterator<Item = (i32, &str)> + '_ {
        let first = (self.acknowledge + 1).max(self.sequence - self.capacity() as i32 + 1);
        (first..=self.sequence).map(move |seq| (seq, self.get(seq)))
    }

    fn store(&mut self, sequence: i32, text: &str) {
        let index = self.index(sequence);
        self.commands[index] = text.to_string();
        self.sequence = sequence;
    }

    fn index(&self, sequence: i32) -> usize {
        sequence.rem_euclid(self.capacity() as i32) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_channel_starts_at_zero() {
        let channel = ReliableChannel::new();
        assert_eq!(channel.sequence(), 0);
        assert_eq!(channel.acknowledge(), 0);
        assert_eq!(channel.pending().count(), 0);
    }

    #[test]
    fn test_push_and_acknowledge_all() {
        let mut channel = ReliableChannel::new();
        let n = MAX_RELIABLE_COMMANDS as i32;
        for i in 1..=n {
            assert_eq!(channel.push(&format!("print {}", i)).unwrap(), i);
        }
        channel.set_acknowledge(n).unwrap();
        assert_eq!(channel.sequence(), n);
        assert_eq!(channel.acknowledge(), n);
        assert_eq!(channel.unacknowledged(), 0);
    }

    #[test]
    fn test_overflow_leaves_ring_untouched() {
        let mut channel = ReliableChannel::new();
        for i in 0..MAX_RELIABLE_COMMANDS {
            channel.push(&format!("cmd {}", i)).unwrap();
        }
        let err = channel.push("one too many").unwrap_err();
        assert_eq!(
            err,
            ReliableError::Overflow {
                sequence: MAX_RELIABLE_COMMANDS as i32 + 1,
                acknowledge: 0
            }
        );
        assert_eq!(channel.sequence(), MAX_RELIABLE_COMMANDS as i32);
        assert_eq!(channel.get(1), "cmd 0");
    }

    #[test]
    fn test_force_push_overwrites_oldest() {
        let mut channel = ReliableChannel::new();
        for i in 0..MAX_RELIABLE_COMMANDS {
            channel.push(&format!("cmd {}", i)).unwrap();
        }
        let seq = channel.force_push("disconnect \"overflow\"");
        assert_eq!(seq, MAX_RELIABLE_COMMANDS as i32 + 1);
        let pending: Vec<_> = channel.pending().collect();
        assert_eq!(pending.len(), MAX_RELIABLE_COMMANDS);
        assert_eq!(pending.last().unwrap().1, "disconnect \"overflow\"");
    }

    #[test]
    fn test_acknowledge_window() {
        let mut channel = ReliableChannel::new();
        for _ in 0..10 {
            channel.push("x").unwrap();
        }
        assert!(channel.set_acknowledge(11).is_err());
        assert!(channel.set_acknowledge(-60).is_err());
        assert!(channel.set_acknowledge(4).is_ok());
        let pending: Vec<i32> = channel.pending().map(|(seq, _)| seq).collect();
        assert_eq!(pending, (5..=10).collect::<Vec<_>>());
    }
}
