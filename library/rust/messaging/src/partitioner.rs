use std::sync::atomic::{AtomicU32, Ordering};

/// Partitioner はエンベロープの送信先パーティションを決める。
///
/// キーありは Kafka のデフォルトパーティショナーと同じ murmur2 ハッシュ、
/// キーなしはラウンドロビンで振り分ける。
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicU32,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: Option<&[u8]>, partition_count: i32) -> i32 {
        if partition_count <= 1 {
            return 0;
        }
        let count = partition_count as u32;
        let slot = match key {
            Some(key) => (murmur2(key) & 0x7fff_ffff) % count,
            None => self.next.fetch_add(1, Ordering::Relaxed) % count,
        };
        slot as i32
    }
}

/// Kafka クライアント互換の murmur2 ハッシュ。
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
