//! Chunk I/O engine: part identity, read planning, writing, replication, and
//! the chunkserver connector (spec components C1-C4, C10).

pub mod connector;
pub mod part;
pub mod read_plan;
pub mod replicator;
pub mod writer;

pub use part::{BlockRange, ChunkPartType, BLOCKS_IN_CHUNK, BLOCK_SIZE, CHUNK_SIZE};
pub use read_plan::{plan_standard, plan_xor, AvailablePart, PostProcessOp, ReadOperation, ReadPlan};
