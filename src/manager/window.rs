use tracing::trace;

use crate::ack_bits::AckBitArray;
use crate::packet::ACKED_BITS_BYTES;

/// Acknowledgement id reported before anything has been received.
pub const INITIAL_ACK_ID: u16 = u16::MAX;

/// Largest forward distance at which one sequence number is considered newer than another.
const SEQ_HALF_RANGE: u16 = 0x7FFF;

/// Returns true if `a` is more recent than `b`, accounting for wraparound.
pub fn seq_newer(a: u16, b: u16) -> bool {
    let delta = a.wrapping_sub(b);
    delta != 0 && delta <= SEQ_HALF_RANGE
}

#[derive(Debug, Eq, PartialEq)]
pub enum Receipt {
    New,
    Duplicate,
}

/// Tracks which of the most recent sequence numbers have been received from the remote host.
#[derive(Debug)]
pub struct ReceiveWindow {
    highest_id: u16,
    received_any: bool,
    bits: AckBitArray,
    // Number of low bits which correspond to ids sent after the first one received
    filled: usize,
    lost_count: u64,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self {
            // Acknowledges an id which has not been sent yet
            highest_id: INITIAL_ACK_ID,
            received_any: false,
            bits: AckBitArray::new(ACKED_BITS_BYTES, 0),
            filled: 0,
            lost_count: 0,
        }
    }

    pub fn ack_id(&self) -> u16 {
        self.highest_id
    }

    pub fn acked_bits(&self) -> AckBitArray {
        self.bits
    }

    /// Number of ids which left the window without having been received.
    pub fn lost_count(&self) -> u64 {
        self.lost_count
    }

    /// Marks `id` as received. Ids older than the window are reported as duplicates, since
    /// there is no record of whether they were received.
    pub fn record(&mut self, id: u16) -> Receipt {
        if !self.received_any {
            self.received_any = true;
            self.highest_id = id;
            return Receipt::New;
        }

        let width = self.bits.width_bits();

        if seq_newer(id, self.highest_id) {
            let advance = usize::from(id.wrapping_sub(self.highest_id));

            let dropped = self.bits.shift_left(advance);

            // The previous highest id now sits `advance` places behind the new one
            if advance <= width {
                self.bits.set(advance - 1, true);
            }

            let filled = self.filled;
            let lost = dropped
                .iter()
                .enumerate()
                .filter(|&(i, &bit)| width - 1 - i < filled && !bit)
                .count()
                + (advance - 1).saturating_sub(width);

            self.filled = (filled + advance).min(width);

            if lost > 0 {
                trace!(lost, highest_id = id, "ids left receive window unreceived");
                self.lost_count += lost as u64;
            }

            self.highest_id = id;

            Receipt::New
        } else {
            let age = usize::from(self.highest_id.wrapping_sub(id));

            if age == 0 || age > width {
                return Receipt::Duplicate;
            }

            let index = age - 1;

            if self.bits.get(index) {
                Receipt::Duplicate
            } else {
                self.bits.set(index, true);
                Receipt::New
            }
        }
    }
}
