//! Message counters and response tokens.

use crate::constants::COUNTER_MAX;
use crate::error::ProtocolError;
use crate::message::MessageName;
use std::collections::HashMap;

/// 16-bit per-direction message counter, wrapping at [`COUNTER_MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageCounter(u16);

impl MessageCounter {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Advance by one and return the new value.
    pub fn increment(&mut self) -> u16 {
        self.0 = next_counter(self.0);
        self.0
    }
}

pub fn next_counter(value: u16) -> u16 {
    ((u32::from(value) + 1) % COUNTER_MAX) as u16
}

/// Outstanding request tokens and the request each one answers.
#[derive(Debug, Default)]
pub struct TokenTable {
    last: u8,
    in_flight: HashMap<u8, MessageName>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next free token for `request`.
    ///
    /// A token still mapped to an unanswered request is never reissued; it is
    /// skipped. Fails only when all 256 tokens are in flight.
    pub fn allocate(&mut self, request: MessageName) -> Result<u8, ProtocolError> {
        let mut candidate = self.last;
        for _ in 0..=u8::MAX {
            candidate = candidate.wrapping_add(1);
            if !self.in_flight.contains_key(&candidate) {
                self.last = candidate;
                self.in_flight.insert(candidate, request);
                return Ok(candidate);
            }
        }
        Err(ProtocolError::TokenInFlight(self.last.wrapping_add(1)))
    }

    pub fn request_for(&self, token: u8) -> Option<MessageName> {
        self.in_flight.get(&token).copied()
    }

    pub fn clear(&mut self, token: u8) -> Option<MessageName> {
        self.in_flight.remove(&token)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn clear_all(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_wraps_at_modulus() {
        for value in [0u16, 1, 1000, 65534, 65535] {
            let expected = ((u32::from(value) + 1) % 65536) as u16;
            assert_eq!(next_counter(value), expected);
        }
        let mut counter = MessageCounter::new(u16::MAX);
        assert_eq!(counter.increment(), 0);
        assert_eq!(counter.increment(), 1);
    }

    #[test]
    fn tokens_increment_and_wrap() {
        let mut table = TokenTable::new();
        for expected in 1..=255u8 {
            let token = table.allocate(MessageName::Describe).unwrap();
            assert_eq!(token, expected);
            table.clear(token);
        }
        assert_eq!(table.allocate(MessageName::Describe).unwrap(), 0);
        table.clear(0);
        assert_eq!(table.allocate(MessageName::Describe).unwrap(), 1);
    }

    #[test]
    fn in_flight_token_is_skipped_not_reissued() {
        let mut table = TokenTable::new();
        let first = table.allocate(MessageName::VariableRequest).unwrap();
        for _ in 0..254 {
            let token = table.allocate(MessageName::Describe).unwrap();
            table.clear(token);
        }
        // Next in line is 0, then the pending token, which gets skipped.
        assert_eq!(table.allocate(MessageName::Describe).unwrap(), 0);
        table.clear(0);
        assert_eq!(table.allocate(MessageName::Describe).unwrap(), first + 1);
        assert_eq!(table.request_for(first), Some(MessageName::VariableRequest));
    }

    #[test]
    fn allocation_keeps_going_after_a_collision() {
        let mut table = TokenTable::new();
        let held = table.allocate(MessageName::VariableRequest).unwrap();
        // Several full laps while one token stays pending.
        for _ in 0..3 * 256 {
            let token = table.allocate(MessageName::Describe).unwrap();
            assert_ne!(token, held);
            table.clear(token);
        }
        assert_eq!(table.in_flight(), 1);

        table.clear(held);
        let mut seen: Vec<u8> = (0..256).map(|_| table.allocate(MessageName::Describe).unwrap()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn exhausted_table_reports_token_in_flight() {
        let mut table = TokenTable::new();
        for _ in 0..256 {
            table.allocate(MessageName::Describe).unwrap();
        }
        assert!(matches!(
            table.allocate(MessageName::Describe),
            Err(ProtocolError::TokenInFlight(_))
        ));
        table.clear(42);
        assert_eq!(table.allocate(MessageName::Describe).unwrap(), 42);
    }
}
