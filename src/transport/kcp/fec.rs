//! KCP 前向纠错
//!
//! 分片头：`seqid(u32 LE) | flag(u16 LE) | size(u16 LE) | payload`，
//! flag 为 0xf1 表示数据分片、0xf2 表示校验分片，size 为载荷长度加 2。
//! 每 `data_shards` 个数据分片补零对齐后用 Reed-Solomon 生成 `parity_shards` 个校验分片，
//! 校验覆盖 size 字段和载荷。

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::BTreeMap;
use std::io;
use tracing::trace;

pub const FEC_HEADER_SIZE: usize = 6;
/// 含 size 字段的分片头长度
pub const FEC_HEADER_SIZE_PLUS2: usize = FEC_HEADER_SIZE + 2;

pub const TYPE_DATA: u16 = 0xf1;
pub const TYPE_PARITY: u16 = 0xf2;

/// 接收端保留的分片组数
const RX_GROUP_LIMIT: u32 = 16;

fn new_codec(data_shards: usize, parity_shards: usize) -> io::Result<ReedSolomon> {
    ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("fec: {:?}", e)))
}

/// 序号回绕点，保证同一组分片不会跨越回绕
fn paws(shard_size: usize) -> u32 {
    (u32::MAX / shard_size as u32) * shard_size as u32
}

pub struct FecEncoder {
    codec: ReedSolomon,
    data_shards: usize,
    parity_shards: usize,
    next: u32,
    paws: u32,
    /// 当前组内已收集的数据分片（从 size 字段开始）
    cache: Vec<Vec<u8>>,
}

impl FecEncoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> io::Result<Self> {
        Ok(Self {
            codec: new_codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
            next: 0,
            paws: paws(data_shards + parity_shards),
            cache: Vec::with_capacity(data_shards),
        })
    }

    fn mark(&mut self, header: &mut [u8], flag: u16) {
        header[..4].copy_from_slice(&self.next.to_le_bytes());
        header[4..6].copy_from_slice(&flag.to_le_bytes());
        self.next = (self.next + 1) % self.paws;
    }

    /// 为一个数据包写入分片头
    ///
    /// `packet` 的前 `FEC_HEADER_SIZE_PLUS2` 字节为预留的头部。
    /// 凑满一组时返回本组的校验分片（同样带有预留头部之外的完整分片头）。
    pub fn encode(&mut self, packet: &mut [u8]) -> Vec<Vec<u8>> {
        self.mark(packet, TYPE_DATA);
        let size = (packet.len() - FEC_HEADER_SIZE) as u16;
        packet[FEC_HEADER_SIZE..FEC_HEADER_SIZE_PLUS2].copy_from_slice(&size.to_le_bytes());
        self.cache.push(packet[FEC_HEADER_SIZE..].to_vec());
        if self.cache.len() < self.data_shards {
            return Vec::new();
        }

        let max = self.cache.iter().map(Vec::len).max().unwrap_or(0);
        let mut shards: Vec<Vec<u8>> = self.cache.drain(..).collect();
        for shard in shards.iter_mut() {
            shard.resize(max, 0);
        }
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; max]));
        if let Err(e) = self.codec.encode(&mut shards) {
            trace!("fec encode failed: {:?}", e);
            return Vec::new();
        }

        let parity: Vec<Vec<u8>> = shards.split_off(self.data_shards);
        parity
            .into_iter()
            .map(|shard| {
                let mut out = vec![0u8; FEC_HEADER_SIZE];
                self.mark(&mut out, TYPE_PARITY);
                out.extend_from_slice(&shard);
                out
            })
            .collect()
    }
}

#[derive(Default)]
struct ShardGroup {
    shards: Vec<Option<Vec<u8>>>,
    received: usize,
    recovered: bool,
}

pub struct FecDecoder {
    codec: ReedSolomon,
    data_shards: usize,
    shard_size: usize,
    groups: BTreeMap<u32, ShardGroup>,
}

impl FecDecoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> io::Result<Self> {
        Ok(Self {
            codec: new_codec(data_shards, parity_shards)?,
            data_shards,
            shard_size: data_shards + parity_shards,
            groups: BTreeMap::new(),
        })
    }

    /// 输入一个带分片头的包
    ///
    /// # 返回
    /// 可以直接交给 KCP 的数据（本包是数据分片时为其载荷），以及恢复出的数据分片载荷
    pub fn decode(&mut self, packet: &[u8]) -> (Option<Vec<u8>>, Vec<Vec<u8>>) {
        if packet.len() <= FEC_HEADER_SIZE_PLUS2 {
            return (None, Vec::new());
        }
        let seqid = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let flag = u16::from_le_bytes([packet[4], packet[5]]);
        let direct = match flag {
            TYPE_DATA => Some(packet[FEC_HEADER_SIZE_PLUS2..].to_vec()),
            TYPE_PARITY => None,
            _ => return (None, Vec::new()),
        };

        let shard_size = self.shard_size as u32;
        let group_id = seqid / shard_size;
        let index = (seqid % shard_size) as usize;
        self.expire(group_id);

        let shard_count = self.shard_size;
        let group = self.groups.entry(group_id).or_insert_with(|| ShardGroup {
            shards: vec![None; shard_count],
            ..Default::default()
        });
        if group.recovered || group.shards[index].is_some() {
            return (direct, Vec::new());
        }
        group.shards[index] = Some(packet[FEC_HEADER_SIZE..].to_vec());
        group.received += 1;

        let data_shards = self.data_shards;
        let mut recovered = Vec::new();
        if group.received >= data_shards {
            let missing: Vec<usize> = (0..data_shards).filter(|i| group.shards[*i].is_none()).collect();
            group.recovered = true;
            if !missing.is_empty() {
                let max = group.shards.iter().flatten().map(Vec::len).max().unwrap_or(0);
                for shard in group.shards.iter_mut().flatten() {
                    shard.resize(max, 0);
                }
                if self.codec.reconstruct_data(&mut group.shards).is_ok() {
                    for i in missing {
                        if let Some(payload) = group.shards[i].as_deref().and_then(shard_payload) {
                            recovered.push(payload.to_vec());
                        }
                    }
                }
            }
            group.shards.iter_mut().for_each(|s| *s = None);
        }
        (direct, recovered)
    }

    fn expire(&mut self, newest: u32) {
        let floor = newest.saturating_sub(RX_GROUP_LIMIT);
        // 序号回绕后旧组整体作废
        if self.groups.keys().next_back().is_some_and(|last| *last > newest + RX_GROUP_LIMIT) {
            self.groups.clear();
        }
        self.groups = self.groups.split_off(&floor);
    }
}

/// 从恢复出的分片（以 size 字段开头）中取出载荷
fn shard_payload(shard: &[u8]) -> Option<&[u8]> {
    if shard.len() < 2 {
        return None;
    }
    let size = u16::from_le_bytes([shard[0], shard[1]]) as usize;
    if size < 2 || size > shard.len() {
        return None;
    }
    Some(&shard[2..size])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet(payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; FEC_HEADER_SIZE_PLUS2];
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_header_layout() {
        let mut enc = FecEncoder::new(3, 1).unwrap();
        let mut packet = data_packet(b"abc");
        assert!(enc.encode(&mut packet).is_empty());
        assert_eq!(&packet[..4], &0u32.to_le_bytes());
        assert_eq!(&packet[4..6], &TYPE_DATA.to_le_bytes());
        assert_eq!(&packet[6..8], &5u16.to_le_bytes());
    }

    #[test]
    fn test_parity_emitted_per_group() {
        let mut enc = FecEncoder::new(2, 2).unwrap();
        assert!(enc.encode(&mut data_packet(b"one")).is_empty());
        let parity = enc.encode(&mut data_packet(b"three"));
        assert_eq!(parity.len(), 2);
        for (i, p) in parity.iter().enumerate() {
            let seq = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
            assert_eq!(seq, 2 + i as u32);
            assert_eq!(u16::from_le_bytes([p[4], p[5]]), TYPE_PARITY);
            assert_eq!(p.len(), FEC_HEADER_SIZE + 2 + 5);
        }
    }

    #[test]
    fn test_recover_lost_data_shard() {
        let mut enc = FecEncoder::new(3, 2).unwrap();
        let mut dec = FecDecoder::new(3, 2).unwrap();
        let payloads: [&[u8]; 3] = [b"first", b"second packet", b"3"];
        let mut wire = Vec::new();
        for p in payloads {
            let mut packet = data_packet(p);
            let parity = enc.encode(&mut packet);
            wire.push(packet);
            wire.extend(parity);
        }
        assert_eq!(wire.len(), 5);

        // 丢掉第二个数据分片
        let mut direct = Vec::new();
        let mut recovered = Vec::new();
        for (i, packet) in wire.iter().enumerate() {
            if i == 1 {
                continue;
            }
            let (d, r) = dec.decode(packet);
            direct.extend(d);
            recovered.extend(r);
        }
        assert_eq!(direct, vec![b"first".to_vec(), b"3".to_vec()]);
        assert_eq!(recovered, vec![b"second packet".to_vec()]);
    }

    #[test]
    fn test_no_recovery_when_complete() {
        let mut enc = FecEncoder::new(2, 1).unwrap();
        let mut dec = FecDecoder::new(2, 1).unwrap();
        let mut a = data_packet(b"aa");
        enc.encode(&mut a);
        let mut b = data_packet(b"bbbb");
        let parity = enc.encode(&mut b);
        assert_eq!(dec.decode(&a).0.unwrap(), b"aa");
        assert_eq!(dec.decode(&b).0.unwrap(), b"bbbb");
        let (d, r) = dec.decode(&parity[0]);
        assert!(d.is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn test_garbage_ignored() {
        let mut dec = FecDecoder::new(2, 1).unwrap();
        assert_eq!(dec.decode(&[0u8; 4]), (None, Vec::new()));
        let mut bad = vec![0u8; 12];
        bad[4] = 0x11;
        assert_eq!(dec.decode(&bad), (None, Vec::new()));
    }
}
