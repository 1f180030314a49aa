//! DHT node identifier and the XOR distance metric Kademlia routing is
//! built on (spec.md §4.7).

use rand::RngCore;

pub const NODE_ID_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

/// XOR distance between two node ids, itself orderable byte-wise (the
/// lower the value, the closer the id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Distance([u8; NODE_ID_LEN]);

impl NodeId {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// # Errors
    ///
    /// Returns `Err` if `bytes` is not exactly 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != NODE_ID_LEN {
            return Err("node id must be 20 bytes");
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; NODE_ID_LEN] {
        self.0
    }

    #[must_use]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Generates a random id within the bucket range `[prefix_bits]` shared
    /// with `self` (used for bucket-refresh `find_node(random_id_in_range)`,
    /// spec.md §4.7 "Periodic bucket refresh").
    #[must_use]
    pub fn random_in_prefix(&self, prefix_bits: u32) -> NodeId {
        let mut bytes = self.0;
        let mut rng = rand::thread_rng();
        let mut random = [0u8; NODE_ID_LEN];
        rng.fill_bytes(&mut random);

        let full_bytes = (prefix_bits / 8) as usize;
        let remaining_bits = prefix_bits % 8;
        for byte in bytes.iter_mut().skip(full_bytes) {
            *byte = 0;
        }
        for (i, byte) in random.iter().enumerate().skip(full_bytes) {
            if i == full_bytes && remaining_bits > 0 {
                let mask = 0xFFu8 << (8 - remaining_bits);
                bytes[i] = (bytes[i] & mask) | (byte & !mask);
            } else if i > full_bytes || (i == full_bytes && remaining_bits == 0) {
                bytes[i] = *byte;
            }
        }
        NodeId(bytes)
    }

    /// Index (0 = most significant) of the first bit that differs between
    /// `self` and `other`, i.e. the length of their shared prefix. Used to
    /// decide which half of a split bucket a node belongs to.
    #[must_use]
    pub fn shared_prefix_len(&self, other: &NodeId) -> u32 {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let xor = a ^ b;
            if xor != 0 {
                #[allow(clippy::cast_possible_truncation)]
                return (i as u32) * 8 + u32::from(xor.leading_zeros());
            }
        }
        (NODE_ID_LEN as u32) * 8
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NodeId;

    #[test]
    fn should_compute_zero_distance_to_self() {
        let id = NodeId::generate();
        let zero_distance = NodeId::from_bytes([0u8; 20]).distance(&NodeId::from_bytes([0u8; 20]));
        assert_eq!(id.distance(&id), zero_distance);
    }

    #[test]
    fn should_order_distance_bytewise() {
        let a = NodeId::from_bytes([0u8; 20]);
        let mut far_bytes = [0u8; 20];
        far_bytes[0] = 1;
        let b = NodeId::from_bytes(far_bytes);
        let mut closer_bytes = [0u8; 20];
        closer_bytes[19] = 1;
        let c = NodeId::from_bytes(closer_bytes);

        assert!(a.distance(&c) < a.distance(&b));
    }

    #[test]
    fn should_compute_shared_prefix_length() {
        let a = NodeId::from_bytes([0u8; 20]);
        let mut b_bytes = [0u8; 20];
        b_bytes[0] = 0b0000_0001;
        let b = NodeId::from_bytes(b_bytes);
        assert_eq!(a.shared_prefix_len(&b), 7);
    }

    #[test]
    fn should_generate_a_random_id_sharing_the_requested_prefix() {
        let base = NodeId::from_bytes([0xAAu8; 20]);
        let random = base.random_in_prefix(12);
        assert!(base.shared_prefix_len(&random) >= 12);
    }
}
