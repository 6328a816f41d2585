use std::collections::HashMap;

use crate::ack_bits::AckBitArray;

#[derive(Debug)]
pub struct Outstanding {
    // Serialized packet, resent as-is apart from its ack fields
    pub packet: Box<[u8]>,
    pub send_time_ms: u64,
    pub resend_count: u8,
}

/// Reliable packets which have been sent but not yet acknowledged, keyed by sequence number.
#[derive(Debug, Default)]
pub struct OutstandingTable {
    entries: HashMap<u16, Outstanding>,
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: u16, packet: Box<[u8]>, now_ms: u64) {
        let prev = self.entries.insert(
            id,
            Outstanding {
                packet,
                send_time_ms: now_ms,
                resend_count: 0,
            },
        );

        debug_assert!(prev.is_none(), "sequence number {} reused while in flight", id);
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Outstanding> {
        self.entries.get_mut(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns the id of the entry sent furthest behind `next_id`.
    pub fn oldest(&self, next_id: u16) -> Option<u16> {
        self.entries
            .keys()
            .copied()
            .max_by_key(|&id| next_id.wrapping_sub(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes every entry acknowledged by the given ack fields. Returns the number removed.
    pub fn acknowledge(&mut self, ack_id: u16, acked_bits: &AckBitArray) -> usize {
        if self.entries.is_empty() {
            return 0;
        }

        let mut count = 0;

        if self.entries.remove(&ack_id).is_some() {
            count += 1;
        }

        let mut bits = acked_bits.to_u64();

        while bits != 0 {
            let index = bits.trailing_zeros() as u16;
            bits &= bits - 1;

            let id = ack_id.wrapping_sub(1 + index);

            if self.entries.remove(&id).is_some() {
                count += 1;
            }
        }

        count
    }

    /// Time at which the oldest entry becomes due for a resend.
    pub fn next_resend_ms(&self, resend_timeout_ms: u64) -> Option<u64> {
        self.entries
            .values()
            .map(|entry| entry.send_time_ms + resend_timeout_ms)
            .min()
    }

    /// Returns the ids of all entries due for a resend, oldest first.
    pub fn due(&self, now_ms: u64, resend_timeout_ms: u64) -> Vec<u16> {
        let mut due = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.send_time_ms + resend_timeout_ms <= now_ms)
            .map(|(&id, entry)| (entry.send_time_ms, id))
            .collect::<Vec<_>>();

        due.sort_unstable();

        due.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ACKED_BITS_BYTES;

    fn table_with(ids: &[u16]) -> OutstandingTable {
        let mut table = OutstandingTable::new();

        for &id in ids {
            table.insert(id, vec![id as u8].into_boxed_slice(), 0);
        }

        table
    }

    #[test]
    fn acknowledge_selective() {
        let mut table = table_with(&[10, 11, 12, 13, 14]);

        // Acks 14, 13 and 11, but not 12 or 10
        let acked_bits = AckBitArray::new(ACKED_BITS_BYTES, 0b101);
        assert_eq!(table.acknowledge(14, &acked_bits), 3);

        assert!(table.contains(10));
        assert!(table.contains(12));
        assert_eq!(table.len(), 2);

        // Acknowledging again is harmless
        assert_eq!(table.acknowledge(14, &acked_bits), 0);
    }

    #[test]
    fn acknowledge_across_wraparound() {
        let mut table = table_with(&[65534, 65535, 0, 1]);

        let acked_bits = AckBitArray::new(ACKED_BITS_BYTES, u64::MAX);
        assert_eq!(table.acknowledge(1, &acked_bits), 4);
        assert!(table.is_empty());
    }

    #[test]
    fn acknowledge_last_window_bit() {
        let mut table = table_with(&[100 - 64, 100 - 65]);

        let acked_bits = AckBitArray::new(ACKED_BITS_BYTES, 1 << 63);
        assert_eq!(table.acknowledge(100, &acked_bits), 1);
        assert!(table.contains(100 - 65));
    }

    #[test]
    fn oldest_across_wraparound() {
        assert_eq!(OutstandingTable::new().oldest(0), None);

        let table = table_with(&[65533, 65535, 1]);
        assert_eq!(table.oldest(2), Some(65533));
        assert_eq!(table_with(&[1]).oldest(2), Some(1));
    }

    #[test]
    fn due_oldest_first() {
        let mut table = OutstandingTable::new();

        table.insert(7, Box::default(), 30);
        table.insert(5, Box::default(), 10);
        table.insert(6, Box::default(), 20);

        assert_eq!(table.next_resend_ms(100), Some(110));
        assert!(table.due(109, 100).is_empty());
        assert_eq!(table.due(125, 100), vec![5, 6]);
        assert_eq!(table.due(1000, 100), vec![5, 6, 7]);
    }
}
