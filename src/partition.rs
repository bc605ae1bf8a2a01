// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Partitioners decide which parallel reader owns a record.
//!
//! Assignment must depend only on the record header so that a restarted
//! reader sees the same split of the same log range.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, ThlError};
use crate::event::EventHeader;

/// Shard id given to records whose shard could not be determined.
pub const SHARD_ID_UNKNOWN: &str = "#UNKNOWN";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionerResponse {
    pub partition: u32,
    /// Critical records must be applied with all other partitions quiesced.
    pub critical: bool,
}

pub trait Partitioner: Send + Sync {
    /// Owning partition for `header`, asked on behalf of reader `task_id`.
    fn partition(&self, header: &EventHeader, task_id: u32) -> Result<PartitionerResponse>;

    fn partitions(&self) -> u32;
}

fn check_task(task_id: u32, partitions: u32) -> Result<()> {
    if partitions == 0 {
        return Err(ThlError::Partition("no partitions configured".into()));
    }
    if task_id >= partitions {
        return Err(ThlError::Partition(format!(
            "task ID exceeds available partitions: taskId={} availablePartitions={}",
            task_id, partitions
        )));
    }
    Ok(())
}

/// Stable hash of the shard id. crc32 keeps the value identical across
/// builds and platforms.
fn shard_hash(shard_id: &str, partitions: u32) -> u32 {
    crc32fast::hash(shard_id.as_bytes()) % partitions
}

/// Spreads shards over partitions by hashing the shard id.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    partitions: u32,
}

impl HashPartitioner {
    pub fn new(partitions: u32) -> Self {
        Self { partitions }
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, header: &EventHeader, task_id: u32) -> Result<PartitionerResponse> {
        check_task(task_id, self.partitions)?;
        Ok(PartitionerResponse {
            partition: shard_hash(&header.shard_id, self.partitions),
            critical: false,
        })
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }
}

/// Explicit shard-to-partition table with a default partition and a set of
/// critical shards. Shards missing from the table fall back to hashing.
///
/// The table is read from `key=value` lines:
/// ```text
/// # comment
/// orders=1
/// (*)=0
/// (critical)=billing,audit
/// ```
#[derive(Clone, Debug)]
pub struct ShardListPartitioner {
    partitions: u32,
    shard_table: HashMap<String, u32>,
    default_partition: Option<u32>,
    critical: HashSet<String>,
}

impl ShardListPartitioner {
    pub fn new(partitions: u32) -> Self {
        let mut critical = HashSet::new();
        critical.insert(SHARD_ID_UNKNOWN.to_string());
        Self {
            partitions,
            shard_table: HashMap::new(),
            default_partition: None,
            critical,
        }
    }

    pub fn parse(partitions: u32, text: &str) -> Result<Self> {
        let mut partitioner = Self::new(partitions);
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ThlError::Config(format!("malformed shard map line: {}", line)))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "(*)" => partitioner.default_partition = Some(parse_partition(value)?),
                "(critical)" => {
                    for shard in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        partitioner.critical.insert(shard.to_string());
                    }
                }
                shard => {
                    partitioner.assign(shard, parse_partition(value)?);
                }
            }
        }
        Ok(partitioner)
    }

    pub fn assign(&mut self, shard_id: impl Into<String>, partition: u32) -> &mut Self {
        self.shard_table.insert(shard_id.into(), partition);
        self
    }
}

fn parse_partition(value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| ThlError::Config(format!("invalid partition number: {}", value)))
}

impl Partitioner for ShardListPartitioner {
    fn partition(&self, header: &EventHeader, task_id: u32) -> Result<PartitionerResponse> {
        check_task(task_id, self.partitions)?;
        let partition = match self.shard_table.get(&header.shard_id) {
            Some(p) => *p,
            None => self
                .default_partition
                .unwrap_or_else(|| shard_hash(&header.shard_id, self.partitions)),
        };
        if partition >= self.partitions {
            return Err(ThlError::Partition(format!(
                "shard {} mapped to partition {} but only {} exist",
                header.shard_id, partition, self.partitions
            )));
        }
        Ok(PartitionerResponse {
            partition,
            critical: self.critical.contains(&header.shard_id),
        })
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEvent;

    fn header(shard: &str) -> EventHeader {
        LogEvent::new(1, 0, true, "src", 0, "", vec![])
            .with_shard(shard)
            .header()
    }

    #[test]
    fn test_hash_partition_is_stable() {
        let p = HashPartitioner::new(4);
        let a = p.partition(&header("orders"), 0).unwrap();
        let b = p.partition(&header("orders"), 3).unwrap();
        assert_eq!(a, b);
        assert!(a.partition < 4);
    }

    #[test]
    fn test_task_out_of_range() {
        let p = HashPartitioner::new(2);
        assert!(p.partition(&header("x"), 2).is_err());
    }

    #[test]
    fn test_shard_list() {
        let text = "# map\norders=1\n(*)=0\n(critical)=billing, audit\n";
        let p = ShardListPartitioner::parse(3, text).unwrap();
        assert_eq!(p.partition(&header("orders"), 0).unwrap().partition, 1);
        assert_eq!(p.partition(&header("misc"), 0).unwrap().partition, 0);
        assert!(p.partition(&header("audit"), 0).unwrap().critical);
        assert!(p.partition(&header(SHARD_ID_UNKNOWN), 0).unwrap().critical);
        assert!(!p.partition(&header("orders"), 0).unwrap().critical);
    }
}
