/// Seed of the djb2 construction.
const DJB2_SEED: u32 = 5381;

/// Content checksum of a block: djb2 (`h = h * 33 + byte`, seed 5381).
/// Cheap and advisory only; equal checksums do not imply equal content.
pub fn block_checksum(data: &[u8]) -> u32 {
    data.iter().fold(DJB2_SEED, |h, &b| {
        h.wrapping_shl(5).wrapping_add(h).wrapping_add(b as u32)
    })
}

/// 32-bit integrity checksum for metadata records (journal headers,
/// version nodes). Uses XXH3 folded to 32 bits.
pub fn record_checksum(bytes: &[u8]) -> u32 {
    let h = xxhash_rust::xxh3::xxh3_64(bytes);
    (h ^ (h >> 32)) as u32
}
