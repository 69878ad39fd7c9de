//! Chunk writer (spec §4.3, component C3).
//!
//! Accepts a stream of block writes destined for one chunk version across a
//! set of chunkserver targets, batches them into stripe-aligned operations,
//! performs read-modify-write for partial stripes, computes parity, and
//! tracks completion of the in-flight write_id set.

use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};

use crate::chunk::part::{ChunkPartType, BLOCK_SIZE};
use crate::error::Status;
use crate::net::NetworkAddress;

/// One chunkserver holding one part of the chunk being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget {
    pub part: ChunkPartType,
    pub server: NetworkAddress,
}

/// A single block write request as it arrives from the caller.
#[derive(Debug, Clone)]
pub struct WriteBlock {
    pub block_index: u32,
    pub from: u16,
    pub to: u16,
    pub data: Bytes,
}

impl WriteBlock {
    fn is_full_block(&self) -> bool {
        self.from == 0 && self.to as u32 == BLOCK_SIZE
    }
}

pub type WriteId = u64;
pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Still accepting further writes that fall in its combined stripe.
    Accumulating,
    /// Packets sent, waiting for every target's status.
    InFlight,
    Completed,
}

/// A group of writes sharing `(from, to)` that land in one combined stripe,
/// each at a distinct block index within it (spec §4.3).
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub stripe_index: u32,
    pub from: u16,
    pub to: u16,
    pub writes: Vec<WriteBlock>,
    pub state: OperationState,
}

impl Operation {
    /// Whether this operation touches every block position of its combined
    /// stripe, i.e. needs no read-modify-write before parity can be computed.
    fn is_full_stripe(&self, combined_stripe_blocks: u32) -> bool {
        self.writes.len() as u32 == combined_stripe_blocks
    }

    /// Two operations collide when they share a combined stripe position:
    /// spec §4.3 allows at most one write operation per combined stripe
    /// position in flight at a time.
    fn collides_with(&self, other: &Operation) -> bool {
        self.stripe_index == other.stripe_index
    }
}

/// A failure the writer raises mid-operation (spec §4.3, §7): the caller may
/// retry with a fresh allocation, or treat it as fatal.
#[derive(Debug, thiserror::Error)]
pub enum WriteFailure {
    #[error("recoverable write failure on {server} (status {status:?})")]
    Recoverable { server: NetworkAddress, status: Status },
    #[error("fatal write failure: {0}")]
    Fatal(String),
}

/// Where a missing stripe position's bytes should be fetched from during
/// partial-stripe read-modify-write (spec §4.3 preference order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwSource {
    /// (1) Any standard replica on any target.
    Standard(NetworkAddress),
    /// (2) Reconstruct via the lowest-level parity piece XORed with the
    /// remaining data pieces of that stripe.
    ViaParity { level: u8, parity: NetworkAddress },
    /// (3) The data piece that naturally holds the block.
    NaturalPiece(NetworkAddress),
}

/// Picks the read source for a missing stripe position, per spec §4.3's
/// preference order. `targets` is every known target for the chunk's parts;
/// `level` is the data piece's XOR level and `piece` its own piece number.
pub fn choose_rmw_source(
    targets: &[WriteTarget],
    level: u8,
    piece: u8,
) -> Option<RmwSource> {
    if let Some(t) = targets.iter().find(|t| t.part.is_standard()) {
        return Some(RmwSource::Standard(t.server));
    }
    let lowest_parity = targets
        .iter()
        .filter(|t| t.part.is_parity())
        .min_by_key(|t| t.part.level().unwrap_or(u8::MAX))?;
    if lowest_parity.part.level() == Some(level) {
        return Some(RmwSource::ViaParity {
            level,
            parity: lowest_parity.server,
        });
    }
    targets
        .iter()
        .find(|t| t.part == ChunkPartType::Xor { level, piece })
        .map(|t| RmwSource::NaturalPiece(t.server))
}

/// Computes the parity block for one stripe by seeding with the first data
/// block and XORing the rest in (spec §4.3 "parity generation").
pub fn compute_parity(data_blocks: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::from(data_blocks.first().copied().unwrap_or(&[][..]));
    if out.len() < BLOCK_SIZE as usize {
        out.resize(BLOCK_SIZE as usize, 0);
    }
    for block in data_blocks.iter().skip(1) {
        for (b, s) in out.iter_mut().zip(block.iter()) {
            *b ^= s;
        }
    }
    out.freeze()
}

/// One target's payload for a dispatched write: either the bytes are ready
/// to send, or the missing sibling must be fetched per `RmwSource` first and
/// parity recomputed once it arrives (spec §4.3 partial-stripe RMW).
#[derive(Debug, Clone)]
pub enum WritePayload {
    Ready(Bytes),
    NeedsRead(RmwSource),
}

/// One outbound packet `flush_ready` routed to a specific target.
#[derive(Debug, Clone)]
pub struct WriteDispatch {
    pub write_id: WriteId,
    pub operation_id: OperationId,
    pub target: WriteTarget,
    pub payload: WritePayload,
}

/// Combined stripe size in blocks: the LCM of every target XOR level present
/// (a standard target contributes a stripe size of 1).
pub fn combined_stripe_blocks(targets: &[WriteTarget]) -> u32 {
    targets
        .iter()
        .filter_map(|t| t.part.level())
        .map(|l| l as u32)
        .fold(1, lcm)
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u32, b: u32) -> u32 {
    if a == 0 || b == 0 {
        0
    } else {
        a / gcd(a, b) * b
    }
}

/// Drives the accumulate-then-flush lifecycle of one chunk's write stream.
pub struct ChunkWriter {
    chunk_id: u64,
    version: u32,
    targets: Vec<WriteTarget>,
    combined_stripe: u32,
    next_operation_id: OperationId,
    next_write_id: WriteId,
    /// Kept in insertion order per spec §4.3 "start ordering".
    operations: VecDeque<Operation>,
    write_id_to_operation: HashMap<WriteId, OperationId>,
    known_file_length: u64,
}

impl ChunkWriter {
    pub fn new(chunk_id: u64, version: u32, targets: Vec<WriteTarget>, known_file_length: u64) -> Self {
        let combined_stripe = combined_stripe_blocks(&targets);
        ChunkWriter {
            chunk_id,
            version,
            targets,
            combined_stripe,
            next_operation_id: 0,
            next_write_id: 0,
            operations: VecDeque::new(),
            write_id_to_operation: HashMap::new(),
            known_file_length,
        }
    }

    pub fn chunk_id(&self) -> u64 {
        self.chunk_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Accepts one block write, grouping it into an existing expandable
    /// operation when possible, else starting a new one.
    pub fn accept(&mut self, write: WriteBlock) -> OperationId {
        let stripe_index = write.block_index / self.combined_stripe.max(1);
        if let Some(op) = self.operations.iter_mut().rev().find(|op| {
            op.state == OperationState::Accumulating
                && op.stripe_index == stripe_index
                && op.from == write.from
                && op.to == write.to
                && !op.writes.iter().any(|w| w.block_index == write.block_index)
        }) {
            op.writes.push(write);
            return op.id;
        }
        let id = self.next_operation_id;
        self.next_operation_id += 1;
        self.operations.push_back(Operation {
            id,
            stripe_index,
            from: write.from,
            to: write.to,
            writes: vec![write],
            state: OperationState::Accumulating,
        });
        id
    }

    /// Whether `op` may start (no pending, earlier operation collides with
    /// it) -- spec §4.3 "an operation is blocked until every pending
    /// operation it collides with has completed".
    fn may_start(&self, op_id: OperationId) -> bool {
        let idx = match self.operations.iter().position(|o| o.id == op_id) {
            Some(i) => i,
            None => return false,
        };
        !self.operations
            .iter()
            .take(idx)
            .any(|earlier| earlier.state != OperationState::Completed && earlier.collides_with(&self.operations[idx]))
    }

    /// Flushes every operation that is ready to start: full-stripe
    /// operations, and the oldest still-accumulating one if the caller
    /// signals no more data is coming for it via `force`. For each ready
    /// operation, routes each written block to the targets it's actually
    /// relevant to (every standard replica, or the XOR data piece that
    /// naturally holds it), and for parity targets either computes the
    /// parity block directly (full stripe) or falls back to
    /// [`choose_rmw_source`] to say where the missing sibling must be read
    /// from first (spec §4.3 partial-stripe read-modify-write). This
    /// assumes every XOR target shares one level, true of any chunk under a
    /// single goal (spec GLOSSARY "Goal").
    pub fn flush_ready(&mut self, force_oldest: bool) -> Result<Vec<WriteDispatch>> {
        let mut dispatches = Vec::new();
        let ids: Vec<OperationId> = self.operations.iter().map(|o| o.id).collect();
        for (i, id) in ids.iter().enumerate() {
            let ready = {
                let op = &self.operations[i];
                op.state == OperationState::Accumulating
                    && (op.is_full_stripe(self.combined_stripe) || (force_oldest && i == 0))
            };
            if !ready || !self.may_start(*id) {
                continue;
            }
            let full_stripe = self.operations[i].is_full_stripe(self.combined_stripe);
            let stripe_index = self.operations[i].stripe_index;
            let writes = self.operations[i].writes.clone();
            let data_by_block: HashMap<u32, Bytes> = writes.iter().map(|w| (w.block_index, w.data.clone())).collect();
            let targets = self.targets.clone();

            for target in targets {
                match target.part {
                    ChunkPartType::Standard => {
                        for w in &writes {
                            let write_id = self.alloc_write_id(*id);
                            dispatches.push(WriteDispatch { write_id, operation_id: *id, target, payload: WritePayload::Ready(w.data.clone()) });
                        }
                    }
                    ChunkPartType::Xor { level, piece } if !target.part.is_parity() => {
                        for w in &writes {
                            if ChunkPartType::locate_block(level, w.block_index).0 == piece {
                                let write_id = self.alloc_write_id(*id);
                                dispatches.push(WriteDispatch { write_id, operation_id: *id, target, payload: WritePayload::Ready(w.data.clone()) });
                            }
                        }
                    }
                    ChunkPartType::Xor { level, .. } => {
                        if full_stripe {
                            let siblings: Vec<Bytes> = (1..=level)
                                .filter_map(|piece| data_by_block.get(&ChunkPartType::block_index(level, piece, stripe_index)).cloned())
                                .collect();
                            let refs: Vec<&[u8]> = siblings.iter().map(|b| b.as_ref()).collect();
                            let parity = compute_parity(&refs);
                            let write_id = self.alloc_write_id(*id);
                            dispatches.push(WriteDispatch { write_id, operation_id: *id, target, payload: WritePayload::Ready(parity) });
                        } else if let Some(missing_piece) = (1..=level).find(|&piece| !data_by_block.contains_key(&ChunkPartType::block_index(level, piece, stripe_index))) {
                            if let Some(source) = choose_rmw_source(&self.targets, level, missing_piece) {
                                let write_id = self.alloc_write_id(*id);
                                dispatches.push(WriteDispatch { write_id, operation_id: *id, target, payload: WritePayload::NeedsRead(source) });
                            }
                        }
                    }
                }
            }
            self.operations[i].state = OperationState::InFlight;
        }
        Ok(dispatches)
    }

    fn alloc_write_id(&mut self, operation_id: OperationId) -> WriteId {
        let write_id = self.next_write_id;
        self.next_write_id += 1;
        self.write_id_to_operation.insert(write_id, operation_id);
        write_id
    }

    /// Records one target's status for `write_id`. Returns `Ok(Some(op_id))`
    /// when this was the status that completed the operation.
    pub fn ack(&mut self, write_id: WriteId, status: Status) -> Result<Option<OperationId>, WriteFailure> {
        let op_id = *self
            .write_id_to_operation
            .get(&write_id)
            .ok_or_else(|| WriteFailure::Fatal(format!("unknown write_id {}", write_id)))?;
        if !status.is_ok() {
            return Err(WriteFailure::Recoverable {
                server: self.targets.first().map(|t| t.server).unwrap_or(NetworkAddress { ip: 0, port: 0 }),
                status,
            });
        }
        let remaining = self
            .write_id_to_operation
            .iter()
            .filter(|(_, &o)| o == op_id)
            .count();
        if remaining == 1 {
            if let Some(op) = self.operations.iter_mut().find(|o| o.id == op_id) {
                op.state = OperationState::Completed;
                let end = (op.stripe_index as u64 + 1) * self.combined_stripe as u64 * BLOCK_SIZE as u64;
                if end > self.known_file_length {
                    self.known_file_length = end;
                }
            }
            self.write_id_to_operation.retain(|_, &mut o| o != op_id);
            return Ok(Some(op_id));
        }
        self.write_id_to_operation.retain(|w, _| *w != write_id);
        Ok(None)
    }

    pub fn known_file_length(&self) -> u64 {
        self.known_file_length
    }

    pub fn pending_operation_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|o| o.state != OperationState::Completed)
            .count()
    }
}
