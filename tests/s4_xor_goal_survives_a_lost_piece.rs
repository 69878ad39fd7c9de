//! Scenario S4: under an XOR(3) goal, a chunk's data is striped across 3
//! data pieces plus one parity piece (spec §4.1). Losing the chunkserver
//! that holds the piece a given block naturally lives on still lets the
//! read planner reconstruct the exact bytes from parity plus the remaining
//! data pieces.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use lizardfs_core::chunk::part::{BlockRange, ChunkPartType, BLOCK_SIZE};
use lizardfs_core::chunk::read_plan::{apply_post_process, plan_xor, AvailablePart, PostProcessOp, ReadPlan};
use lizardfs_core::metadata::goal::GoalDefinition;
use lizardfs_core::metadata::inode::{InodeId, Mode};
use lizardfs_core::metadata::MetadataGraph;
use lizardfs_core::net::NetworkAddress;

const LEVEL: u8 = 3;
const XOR3_GOAL: u8 = 10;

fn addr(n: u8) -> NetworkAddress {
    NetworkAddress::new(Ipv4Addr::new(10, 0, 0, n), 9422)
}

/// A tiny synthetic chunkserver set: one zero-filled buffer per piece, wide
/// enough to hold the stripe the written block falls in, with parity kept
/// consistent as data blocks are poked in directly (standing in for what
/// `chunk::writer` would have produced).
struct FakeChunk {
    pieces: HashMap<u8, Vec<u8>>,
}

impl FakeChunk {
    fn new(stripes: u32) -> Self {
        let mut pieces = HashMap::new();
        for p in 1..=(LEVEL + 1) {
            pieces.insert(p, vec![0u8; stripes as usize * BLOCK_SIZE as usize]);
        }
        FakeChunk { pieces }
    }

    fn write_block(&mut self, block_index: u32, data: &[u8]) {
        let (piece, stripe) = ChunkPartType::locate_block(LEVEL, block_index);
        let start = stripe as usize * BLOCK_SIZE as usize;
        self.pieces.get_mut(&piece).unwrap()[start..start + data.len()].copy_from_slice(data);
        self.recompute_parity(stripe);
    }

    fn recompute_parity(&mut self, stripe: u32) {
        let start = stripe as usize * BLOCK_SIZE as usize;
        let mut parity = vec![0u8; BLOCK_SIZE as usize];
        for p in 1..=LEVEL {
            for (a, b) in parity.iter_mut().zip(&self.pieces[&p][start..start + BLOCK_SIZE as usize]) {
                *a ^= b;
            }
        }
        self.pieces.get_mut(&(LEVEL + 1)).unwrap()[start..start + BLOCK_SIZE as usize].copy_from_slice(&parity);
    }

    fn fetch(&self, piece: u8, stripe_start: u32, stripe_count: u32) -> Vec<u8> {
        let start = stripe_start as usize * BLOCK_SIZE as usize;
        let end = start + stripe_count as usize * BLOCK_SIZE as usize;
        self.pieces[&piece][start..end].to_vec()
    }

    fn available_excluding(&self, down: u8) -> Vec<AvailablePart> {
        (1..=LEVEL + 1)
            .filter(|&p| p != down)
            .map(|p| AvailablePart { part: ChunkPartType::Xor { level: LEVEL, piece: p }, server: addr(p) })
            .collect()
    }
}

#[test]
fn read_reconstructs_the_block_after_its_piece_server_is_lost() {
    let now = 1_700_000_000;
    let mut graph = MetadataGraph::new(now);
    graph.goals.define(XOR3_GOAL, GoalDefinition::Xor(LEVEL));
    let f = graph.create(InodeId::ROOT, b"striped.bin", Mode::from_bits_truncate(0o640), 0, 0, now).unwrap();
    graph.set_goal(f, XOR3_GOAL, now).unwrap();
    assert_eq!(graph.goal_for(f), Some(GoalDefinition::Xor(LEVEL)));
    graph.write_chunk(f, 0, 0, 0, now).unwrap();

    let block_index = 5u32;
    let (piece, stripe) = ChunkPartType::locate_block(LEVEL, block_index);
    let payload = vec![0x7au8; BLOCK_SIZE as usize];

    let mut chunk = FakeChunk::new(stripe + 1);
    chunk.write_block(block_index, &payload);

    // Kill the server holding the piece this block actually lives on.
    let available = chunk.available_excluding(piece);
    let range = BlockRange::new(block_index, 1);
    let plan = plan_xor(LEVEL, range, &available, None, None).expect("parity + remaining pieces must cover the lost piece");
    assert!(matches!(plan, ReadPlan::Xor { .. }), "losing the natural piece must force a reconstruction plan");

    let mut scratch = vec![0u8; plan.required_buffer_size()];
    for op in plan.basic_read_operations().into_iter().chain(plan.additional_read_operations()) {
        let piece = match op.part {
            ChunkPartType::Xor { piece, .. } => piece,
            ChunkPartType::Standard => unreachable!(),
        };
        let data = chunk.fetch(piece, op.block_start, op.block_count);
        scratch[op.buffer_offset..op.buffer_offset + data.len()].copy_from_slice(&data);
    }

    let mut output = vec![0u8; BLOCK_SIZE as usize];
    let post_ops = match &plan {
        ReadPlan::Xor { post_process_operations, .. } => post_process_operations.clone(),
        ReadPlan::Standard { .. } => unreachable!(),
    };
    // Only the Xor reconstruction op (if present) touches our single-block
    // range; a Gather op would mean the planner thought the piece was still
    // up, which would defeat the point of this scenario.
    assert!(post_ops.iter().any(|op| matches!(op, PostProcessOp::Xor { .. })));
    apply_post_process(&post_ops, &scratch, &mut output);

    assert_eq!(output, payload);
}
