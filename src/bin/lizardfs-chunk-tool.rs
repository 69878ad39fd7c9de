//! Diagnostic CLI for chunk-part stripe arithmetic (spec §4.1). Given an
//! XOR level and a block index, prints which piece and stripe position
//! that block lives at -- useful when debugging a read plan by hand.
//!
//! Usage: `lizardfs-chunk-tool <level> <block_index>`

use anyhow::{bail, Result};

use lizardfs_core::chunk::part::{ChunkPartType, BLOCKS_IN_CHUNK};

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let level: u8 = match args.next() {
        Some(s) => s.parse()?,
        None => bail!("usage: lizardfs-chunk-tool <level> <block_index>"),
    };
    let block_index: u32 = match args.next() {
        Some(s) => s.parse()?,
        None => bail!("usage: lizardfs-chunk-tool <level> <block_index>"),
    };

    let (piece, stripe) = ChunkPartType::locate_block(level, block_index);
    let part = ChunkPartType::xor(level, piece).ok_or_else(|| anyhow::anyhow!("invalid level {}", level))?;
    println!(
        "block {} of {} -> {} (stripe {}, {} blocks in this piece)",
        block_index,
        BLOCKS_IN_CHUNK,
        part,
        stripe,
        part.piece_block_count(BLOCKS_IN_CHUNK)
    );

    Ok(())
}
