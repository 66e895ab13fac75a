//! Wire format for a single BLE fragment.
//!
//! Every field sits at a fixed byte offset so the TTL can be decremented
//! in place during forwarding without a full parse.
//!
//! ```text
//! offset  0      1            9      11     13   14              15               16..
//!         magic  fragment_id  index  total  ttl  original_type   recipient_len    recipient_bytes | payload
//! ```

pub const MAGIC: u8 = 0xB1;
/// Offset of the TTL byte, fixed so `decrement_ttl_in_place` never needs to
/// parse the rest of the fragment.
pub const TTL_OFFSET: usize = 13;
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDecodeError {
    TooShort,
    BadMagic,
    TruncatedRecipient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub fragment_id: [u8; 8],
    pub index: u16,
    pub total: u16,
    pub ttl: u8,
    pub original_type: u8,
    pub recipient: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.recipient.len() + self.payload.len());
        out.push(MAGIC);
        out.extend_from_slice(&self.fragment_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.ttl);
        out.push(self.original_type);
        out.push(self.recipient.len() as u8);
        out.extend_from_slice(&self.recipient);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(FragmentDecodeError::TooShort);
        }
        if bytes[0] != MAGIC {
            return Err(FragmentDecodeError::BadMagic);
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&bytes[1..9]);
        let index = u16::from_be_bytes([bytes[9], bytes[10]]);
        let total = u16::from_be_bytes([bytes[11], bytes[12]]);
        let ttl = bytes[TTL_OFFSET];
        let original_type = bytes[14];
        let recipient_len = bytes[15] as usize;
        let recipient_end = HEADER_LEN + recipient_len;
        if bytes.len() < recipient_end {
            return Err(FragmentDecodeError::TruncatedRecipient);
        }
        let recipient = bytes[HEADER_LEN..recipient_end].to_vec();
        let payload = bytes[recipient_end..].to_vec();
        Ok(Self {
            fragment_id,
            index,
            total,
            ttl,
            original_type,
            recipient,
            payload,
        })
    }

    /// Decrements the TTL byte of an already-encoded fragment without
    /// decoding it. Returns `None` if the fragment should be dropped
    /// (TTL already at zero).
    pub fn decrement_ttl_in_place(bytes: &mut [u8]) -> Option<u8> {
        let ttl = *bytes.get(TTL_OFFSET)?;
        if ttl == 0 {
            return None;
        }
        bytes[TTL_OFFSET] = ttl - 1;
        Some(ttl - 1)
    }
}

/// Splits `payload` into fragments no larger than `mtu` bytes on the wire,
/// each carrying `recipient` and `original_type`, ready to be queued for
/// write.
pub fn split_into_fragments(
    fragment_id: [u8; 8],
    original_type: u8,
    recipient: &[u8],
    ttl: u8,
    payload: &[u8],
    mtu: usize,
) -> Vec<Fragment> {
    let overhead = HEADER_LEN + recipient.len();
    let max_chunk = mtu.saturating_sub(overhead).max(1);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(max_chunk).collect()
    };
    let total = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            fragment_id,
            index: i as u16,
            total,
            ttl,
            original_type,
            recipient: recipient.to_vec(),
            payload: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Fragment {
        Fragment {
            fragment_id: [1, 2, 3, 4, 5, 6, 7, 8],
            index: 2,
            total: 5,
            ttl: 7,
            original_type: 9,
            recipient: vec![0xaa, 0xbb],
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let fragment = sample();
        let bytes = fragment.encode();
        let decoded = Fragment::decode(&bytes).unwrap();
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = 0xFF;
        assert_eq!(Fragment::decode(&bytes), Err(FragmentDecodeError::BadMagic));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert_eq!(Fragment::decode(&[0u8; 4]), Err(FragmentDecodeError::TooShort));
    }

    #[test]
    fn ttl_decrements_in_place_at_fixed_offset() {
        let mut bytes = sample().encode();
        assert_eq!(Fragment::decrement_ttl_in_place(&mut bytes), Some(6));
        assert_eq!(bytes[TTL_OFFSET], 6);
    }

    #[test]
    fn ttl_of_zero_signals_drop() {
        let mut fragment = sample();
        fragment.ttl = 0;
        let mut bytes = fragment.encode();
        assert_eq!(Fragment::decrement_ttl_in_place(&mut bytes), None);
    }

    #[test]
    fn splitting_respects_mtu_and_numbers_fragments() {
        let payload = vec![7u8; 100];
        let fragments = split_into_fragments([0; 8], 1, b"r", 7, &payload, 40);
        assert!(fragments.len() > 1);
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.index as usize, i);
            assert_eq!(fragment.total as usize, fragments.len());
            assert!(fragment.encode().len() <= 40);
        }
        let reassembled: Vec<u8> = fragments.iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn empty_payload_still_produces_one_fragment() {
        let fragments = split_into_fragments([0; 8], 1, b"r", 7, &[], 40);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].total, 1);
    }
}
