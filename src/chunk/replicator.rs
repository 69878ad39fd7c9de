//! Chunkserver-side replicator (spec §4.4, component C4).
//!
//! Grounded on `pull_index_chunks` from the teacher's sync client: plan a
//! cover with the read planner, fetch block-by-block, write locally, retry
//! with the failed source excluded, and fail only once no cover exists.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::chunk::part::{BlockRange, ChunkPartType, BLOCKS_IN_CHUNK};
use crate::chunk::read_plan::{apply_post_process, plan_xor, AvailablePart, ReadOperation, ReadPlan};
use crate::net::NetworkAddress;

/// One source the destination chunkserver may fetch a chunk part from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationSource {
    pub address: NetworkAddress,
    pub part: ChunkPartType,
}

/// Abstraction over "fetch this read operation's bytes" and "store the
/// reconstructed part locally", so the replication algorithm can be tested
/// without real sockets.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn fetch(&self, op: ReadOperation) -> Result<Vec<u8>>;
    async fn store_part(&self, chunk_id: u64, version: u32, part: ChunkPartType, data: &[u8]) -> Result<()>;
}

/// Replicates one chunk part to the local store using the given sources,
/// replanning around a failed source up to `max_attempts` times.
pub async fn replicate_part(
    transport: &dyn ChunkTransport,
    chunk_id: u64,
    version: u32,
    level: Option<u8>,
    target_part: ChunkPartType,
    sources: &[ReplicationSource],
    blocks_in_chunk: u32,
    max_attempts: u32,
) -> Result<()> {
    let range = BlockRange::new(0, blocks_in_chunk.min(BLOCKS_IN_CHUNK));
    let mut avoid: Option<ChunkPartType> = None;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let available: Vec<AvailablePart> = sources
            .iter()
            .map(|s| AvailablePart { part: s.part, server: s.address })
            .collect();

        let plan = if target_part.is_standard() {
            sources
                .iter()
                .find(|s| s.part.is_standard())
                .map(|s| crate::chunk::read_plan::plan_standard(s.address, range))
        } else {
            match level {
                Some(l) => plan_xor(l, range, &available, None, avoid),
                None => None,
            }
        };

        let plan = match plan {
            Some(p) => p,
            None => return Err(anyhow!("no cover available to replicate chunk {}", chunk_id)),
        };

        match execute_plan(transport, &plan).await {
            Ok(bytes) => {
                transport.store_part(chunk_id, version, target_part, &bytes).await?;
                return Ok(());
            }
            Err(failed) => {
                if attempts >= max_attempts {
                    return Err(anyhow!(
                        "replication of chunk {} part {:?} failed after {} attempts: {}",
                        chunk_id,
                        target_part,
                        attempts,
                        failed
                    ));
                }
                avoid = Some(failed_part(&plan, &failed));
            }
        }
    }
}

/// Placeholder identifying which part a failed fetch belonged to, used only
/// to feed the next `avoid` hint; a real transport error carries this.
fn failed_part(plan: &ReadPlan, _err: &anyhow::Error) -> ChunkPartType {
    plan.basic_read_operations()
        .first()
        .map(|op| op.part)
        .unwrap_or(ChunkPartType::Standard)
}

async fn execute_plan(transport: &dyn ChunkTransport, plan: &ReadPlan) -> Result<Vec<u8>> {
    match plan {
        ReadPlan::Standard { op } => transport.fetch(*op).await,
        ReadPlan::Xor {
            required_buffer_size,
            basic_read_operations,
            post_process_operations,
            ..
        } => {
            let mut scratch = vec![0u8; *required_buffer_size];
            for op in basic_read_operations {
                let data = transport.fetch(*op).await?;
                scratch[op.buffer_offset..op.buffer_offset + op.byte_len()].copy_from_slice(&data);
            }
            let out_len = post_process_operations
                .iter()
                .map(|op| match op {
                    crate::chunk::read_plan::PostProcessOp::Gather { dst_offset, block_len, block_count, dst_stride, .. }
                    | crate::chunk::read_plan::PostProcessOp::Xor { dst_offset, block_len, block_count, dst_stride, .. } => {
                        dst_offset + (*block_count as usize).saturating_sub(1) * dst_stride + block_len
                    }
                })
                .max()
                .unwrap_or(0);
            let mut output = vec![0u8; out_len];
            apply_post_process(post_process_operations, &scratch, &mut output);
            Ok(output)
        }
    }
}
