//! Piece/block bookkeeping and the `ActivePieceManager` (spec.md §3 `Piece`/
//! `ActivePieceSet`, §4.2). This is the sole source of truth for which
//! blocks are outstanding, to whom, and since when — the orchestrator
//! (`crate::torrent`) drives the pipeline filler and hash verification
//! around it but never tracks in-flight state itself.

use std::collections::HashMap;
use std::time::Duration;

use torrentd_primitives::bitfield::BitField;
use torrentd_primitives::metadata::BLOCK_SIZE;

pub const PIECE_LOG_TARGET: &str = "PIECE";

/// Status of one 16 KiB block within a piece (spec.md §3 `Piece`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    Free,
    InFlight { peer_key: String, sent_at: Duration },
    Received,
}

#[derive(Debug, Clone)]
struct Block {
    begin: u32,
    length: u32,
    status: BlockStatus,
}

/// Lifecycle of one piece inside the active set (spec.md §3 `Piece`
/// transitions: `Idle -> InFlight -> Verifying -> Complete` or `-> Idle` on
/// hash mismatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceLifecycle {
    Downloading,
    Verifying,
}

struct ActivePiece {
    length: u32,
    blocks: Vec<Block>,
    buffer: Vec<u8>,
    /// Every peer that contributed a received block, retained until the
    /// piece is verified or discarded, to support ban-on-corruption
    /// (spec.md §3 invariant).
    contributors: Vec<String>,
    lifecycle: PieceLifecycle,
}

impl ActivePiece {
    fn new(length: u32) -> Self {
        let blocks = block_layout(length).into_iter().map(|(begin, len)| Block { begin, length: len, status: BlockStatus::Free }).collect();
        Self { length, blocks, buffer: vec![0u8; length as usize], contributors: Vec::new(), lifecycle: PieceLifecycle::Downloading }
    }

    fn all_received(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Received)
    }
}

/// Splits a piece of `length` bytes into 16 KiB blocks, the last one
/// possibly shorter (spec.md §3 `Piece`).
#[must_use]
pub fn block_layout(length: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut begin = 0u32;
    #[allow(clippy::cast_possible_truncation)]
    let block_size = BLOCK_SIZE as u32;
    while begin < length {
        let remaining = length - begin;
        let len = remaining.min(block_size);
        out.push((begin, len));
        begin += len;
    }
    out
}

/// `ActivePieceManager` configuration (spec.md §4.2): the sole source of
/// truth for these limits — callers must not hard-code replacements
/// (spec.md Open Questions: `DEFAULT_CONFIG` is canonical).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePieceManagerConfig {
    pub request_timeout: Duration,
    pub max_active_pieces: usize,
    pub max_buffered_bytes: u64,
}

impl Default for ActivePieceManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(30_000),
            max_active_pieces: 150,
            max_buffered_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Default pipeline depth per peer (spec.md §4.1).
pub const MAX_PIPELINE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedBlocks {
    pub index: u32,
    pub data: Vec<u8>,
    pub contributors: Vec<String>,
}

/// Bounds and accounts for in-flight requests across all peers of one
/// torrent (spec.md §4.2).
pub struct ActivePieceManager {
    config: ActivePieceManagerConfig,
    piece_lengths: Vec<u32>,
    pieces: HashMap<u32, ActivePiece>,
}

impl ActivePieceManager {
    #[must_use]
    pub fn new(piece_lengths: Vec<u32>, config: ActivePieceManagerConfig) -> Self {
        Self { config, piece_lengths, pieces: HashMap::new() }
    }

    #[must_use]
    pub fn config(&self) -> ActivePieceManagerConfig {
        self.config
    }

    #[must_use]
    pub fn active_piece_count(&self) -> usize {
        self.pieces.len()
    }

    #[must_use]
    pub fn buffered_bytes(&self) -> u64 {
        self.pieces.values().map(|p| u64::from(p.length)).sum()
    }

    #[must_use]
    pub fn is_active(&self, index: u32) -> bool {
        self.pieces.contains_key(&index)
    }

    fn admits_new_piece(&self, index: u32) -> bool {
        let Some(&length) = self.piece_lengths.get(index as usize) else { return false };
        self.pieces.len() < self.config.max_active_pieces && self.buffered_bytes() + u64::from(length) <= self.config.max_buffered_bytes
    }

    /// Picks the next `(index, begin, length)` to request from `peer_key`,
    /// preferring the rarest-first piece the peer has among pieces already
    /// active, and only admitting a new piece when no in-flight piece
    /// matches (spec.md §4.1 "Pipeline filler"). `rarest_first_order` is the
    /// full candidate piece list the caller has already sorted by
    /// rarity-then-index; this manager does not itself track swarm-wide
    /// availability. `endgame` additionally allows re-requesting blocks the
    /// peer has that are already `InFlight` from someone else, skipping
    /// only blocks this same peer already holds (spec.md §4.1 "Endgame").
    pub fn select_block(&mut self, peer_key: &str, peer_has: &BitField, rarest_first_order: &[u32], endgame: bool, now: Duration) -> Option<(u32, u32, u32)> {
        for &index in rarest_first_order {
            if !peer_has.get(index as usize) {
                continue;
            }
            if let Some(piece) = self.pieces.get_mut(&index) {
                if piece.lifecycle != PieceLifecycle::Downloading {
                    continue;
                }
                if let Some(block) = piece.blocks.iter_mut().find(|b| b.status == BlockStatus::Free) {
                    block.status = BlockStatus::InFlight { peer_key: peer_key.to_owned(), sent_at: now };
                    return Some((index, block.begin, block.length));
                }
                if endgame {
                    if let Some(block) = piece.blocks.iter_mut().find(|b| match &b.status {
                        BlockStatus::InFlight { peer_key: owner, .. } => owner != peer_key,
                        BlockStatus::Free | BlockStatus::Received => false,
                    }) {
                        return Some((index, block.begin, block.length));
                    }
                }
            }
        }

        for &index in rarest_first_order {
            if self.pieces.contains_key(&index) || !peer_has.get(index as usize) {
                continue;
            }
            if !self.admits_new_piece(index) {
                continue;
            }
            let Some(&length) = self.piece_lengths.get(index as usize) else { continue };
            let mut piece = ActivePiece::new(length);
            let block = piece.blocks.first_mut().expect("a non-zero-length piece has at least one block");
            block.status = BlockStatus::InFlight { peer_key: peer_key.to_owned(), sent_at: now };
            let result = (index, block.begin, block.length);
            self.pieces.insert(index, piece);
            return Some(result);
        }

        None
    }

    /// Records a received block (spec.md §4.2 `onBlock`). Returns
    /// `Some(VerifiedBlocks)` once every block of the piece has arrived,
    /// transitioning it to `Verifying` so a concurrent duplicate arrival
    /// cannot start a second verification (spec.md §5 suspension-point
    /// note); the caller hashes the buffer and calls [`Self::complete_piece`]
    /// or [`Self::discard_piece`] once done.
    pub fn on_block(&mut self, index: u32, begin: u32, data: &[u8], peer_key: &str) -> Option<VerifiedBlocks> {
        let piece = self.pieces.get_mut(&index)?;
        if piece.lifecycle != PieceLifecycle::Downloading {
            return None;
        }
        let Some(block) = piece.blocks.iter_mut().find(|b| b.begin == begin) else { return None };
        if block.status == BlockStatus::Received {
            return None;
        }
        block.status = BlockStatus::Received;
        let start = begin as usize;
        piece.buffer[start..start + data.len()].copy_from_slice(data);
        if !piece.contributors.iter().any(|p| p == peer_key) {
            piece.contributors.push(peer_key.to_owned());
        }

        if piece.all_received() {
            piece.lifecycle = PieceLifecycle::Verifying;
            Some(VerifiedBlocks { index, data: piece.buffer.clone(), contributors: piece.contributors.clone() })
        } else {
            None
        }
    }

    /// Clears every `InFlight` record owned by `peer_key` back to `Free`
    /// (spec.md §4.2 `onChoke`) and returns how many were cleared.
    pub fn on_choke(&mut self, peer_key: &str) -> usize {
        let mut cleared = 0usize;
        for piece in self.pieces.values_mut() {
            for block in &mut piece.blocks {
                if let BlockStatus::InFlight { peer_key: owner, .. } = &block.status {
                    if owner == peer_key {
                        block.status = BlockStatus::Free;
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }

    /// Promotes `InFlight` records older than `requestTimeoutMs` back to
    /// `Free` (spec.md §4.2 `onTimeoutTick`). The caller emits
    /// `requestsCleared(n)` for a non-zero return to refill pipelines
    /// (spec.md Open Questions).
    pub fn on_timeout_tick(&mut self, now: Duration) -> usize {
        let mut cleared = 0usize;
        for piece in self.pieces.values_mut() {
            for block in &mut piece.blocks {
                if let BlockStatus::InFlight { sent_at, .. } = &block.status {
                    if now.saturating_sub(*sent_at) >= self.config.request_timeout {
                        block.status = BlockStatus::Free;
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }

    /// Hash failure (spec.md §4.1/§4.3): discards all blocks, resetting the
    /// piece to `Free` so it can be re-requested, and clears its
    /// contributor list. The piece stays in the active set.
    pub fn discard_piece(&mut self, index: u32) {
        if let Some(piece) = self.pieces.get_mut(&index) {
            for block in &mut piece.blocks {
                block.status = BlockStatus::Free;
            }
            piece.buffer.iter_mut().for_each(|b| *b = 0);
            piece.contributors.clear();
            piece.lifecycle = PieceLifecycle::Downloading;
        }
    }

    /// Successful verification: removes the piece from the active set,
    /// freeing its buffered-bytes budget.
    pub fn complete_piece(&mut self, index: u32) {
        self.pieces.remove(&index);
    }

    /// The identities of everyone who contributed a block to `index`, for
    /// ban attribution on hash mismatch (spec.md §4.3 "Ban policy").
    #[must_use]
    pub fn contributors(&self, index: u32) -> Vec<String> {
        self.pieces.get(&index).map(|p| p.contributors.clone()).unwrap_or_default()
    }

    /// Total number of blocks across the active set that are neither
    /// `Received` nor currently `InFlight` to anyone — used by the
    /// orchestrator to decide when to enter endgame (spec.md §4.1:
    /// "when the number of remaining unrequested blocks... drops below
    /// `MAX_PIPELINE`").
    #[must_use]
    pub fn unrequested_block_count(&self) -> usize {
        self.pieces.values().flat_map(|p| p.blocks.iter()).filter(|b| b.status == BlockStatus::Free).count()
    }
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::bitfield::BitField;

    use super::*;

    fn all_ones(count: usize) -> BitField {
        let mut bf = BitField::new(count);
        for i in 0..count {
            bf.set(i, true).unwrap();
        }
        bf
    }

    #[test]
    fn should_split_a_piece_into_sixteen_kib_blocks_with_a_short_tail() {
        let blocks = block_layout(16384 * 2 + 100);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], (32768, 100));
    }

    #[test]
    fn should_admit_a_new_piece_and_hand_out_its_first_block() {
        let mut manager = ActivePieceManager::new(vec![16384, 16384], ActivePieceManagerConfig::default());
        let peer_has = all_ones(2);
        let picked = manager.select_block("peerA", &peer_has, &[0, 1], false, Duration::ZERO).unwrap();
        assert_eq!(picked, (0, 0, 16384));
        assert_eq!(manager.active_piece_count(), 1);
    }

    #[test]
    fn should_verify_a_piece_once_every_block_arrives() {
        let mut manager = ActivePieceManager::new(vec![32], ActivePieceManagerConfig::default());
        let peer_has = all_ones(1);
        let (index, begin, length) = manager.select_block("peerA", &peer_has, &[0], false, Duration::ZERO).unwrap();
        assert!(manager.on_block(index, begin, &vec![1u8; length as usize], "peerA").is_none());
    }

    #[test]
    fn should_clear_in_flight_blocks_on_choke() {
        let mut manager = ActivePieceManager::new(vec![16384], ActivePieceManagerConfig::default());
        let peer_has = all_ones(1);
        manager.select_block("peerA", &peer_has, &[0], false, Duration::ZERO).unwrap();
        assert_eq!(manager.on_choke("peerA"), 1);
        assert_eq!(manager.on_choke("peerA"), 0);
    }

    #[test]
    fn should_clear_timed_out_requests() {
        let mut manager = ActivePieceManager::new(vec![16384], ActivePieceManagerConfig::default());
        let peer_has = all_ones(1);
        manager.select_block("peerA", &peer_has, &[0], false, Duration::from_secs(0)).unwrap();
        assert_eq!(manager.on_timeout_tick(Duration::from_secs(1)), 0);
        assert_eq!(manager.on_timeout_tick(Duration::from_secs(31)), 1);
    }

    #[test]
    fn should_refuse_new_pieces_once_the_buffered_byte_cap_is_reached() {
        let config = ActivePieceManagerConfig { max_buffered_bytes: 16384, ..ActivePieceManagerConfig::default() };
        let mut manager = ActivePieceManager::new(vec![16384, 16384], config);
        let peer_has = all_ones(2);
        manager.select_block("peerA", &peer_has, &[0], false, Duration::ZERO).unwrap();
        assert!(manager.select_block("peerA", &peer_has, &[1], false, Duration::ZERO).is_none());
    }

    #[test]
    fn should_reset_to_free_blocks_on_discard_and_stay_active() {
        let mut manager = ActivePieceManager::new(vec![16384], ActivePieceManagerConfig::default());
        let peer_has = all_ones(1);
        let (index, begin, length) = manager.select_block("peerA", &peer_has, &[0], false, Duration::ZERO).unwrap();
        manager.on_block(index, begin, &vec![9u8; length as usize], "peerA");
        assert_eq!(manager.contributors(index), vec!["peerA".to_owned()]);
        manager.discard_piece(index);
        assert!(manager.contributors(index).is_empty());
        assert!(manager.is_active(index));
        let picked = manager.select_block("peerB", &peer_has, &[0], false, Duration::ZERO).unwrap();
        assert_eq!(picked, (0, 0, 16384));
    }

    #[test]
    fn should_allow_duplicate_requests_in_endgame() {
        let mut manager = ActivePieceManager::new(vec![16384], ActivePieceManagerConfig::default());
        let peer_has = all_ones(1);
        manager.select_block("peerA", &peer_has, &[0], false, Duration::ZERO).unwrap();
        assert!(manager.select_block("peerB", &peer_has, &[0], false, Duration::ZERO).is_none());
        let picked = manager.select_block("peerB", &peer_has, &[0], true, Duration::ZERO).unwrap();
        assert_eq!(picked, (0, 0, 16384));
    }
}
