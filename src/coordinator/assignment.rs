//! Shard-assignment computation and the wire form written under
//! `/scheduler/assignments/<picker_id>`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// A contiguous half-open range `[start, end)` of shard ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub start: u32,
    pub end: u32,
}

impl ShardRange {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn shards(&self) -> impl Iterator<Item = u32> {
        self.start..self.end
    }
}

pub fn encode_assignment(ranges: &[ShardRange]) -> Result<String> {
    serde_json::to_string(ranges).map_err(|e| SchedulerError::Internal(e.to_string()))
}

pub fn decode_assignment(raw: &str) -> Result<Vec<ShardRange>> {
    serde_json::from_str(raw).map_err(|e| SchedulerError::Coordination(e.to_string()))
}

/// Partition `[0, shard_count)` across the live pickers as evenly as
/// possible, preferring stable assignments: each picker keeps as much of its
/// previous contiguous ranges as its new target share allows, and freed
/// shards go to pickers below target.
///
/// The result always covers the shard space exactly once.
pub fn rebalance(
    shard_count: u32,
    live: &[String],
    previous: &HashMap<String, Vec<ShardRange>>,
) -> HashMap<String, Vec<ShardRange>> {
    let mut assignments: HashMap<String, Vec<ShardRange>> = HashMap::new();
    if live.is_empty() || shard_count == 0 {
        return assignments;
    }

    let mut pickers: Vec<&String> = live.iter().collect();
    pickers.sort();
    pickers.dedup();

    let n = pickers.len() as u32;
    let base = shard_count / n;
    let remainder = (shard_count % n) as usize;
    let target =
        |idx: usize| -> u32 { base + if idx < remainder { 1 } else { 0 } };

    let mut taken = vec![false; shard_count as usize];

    // Phase 1: every live picker keeps a prefix of its previous ranges, up
    // to its new target share. Previous assignments may overlap during a
    // handoff window; first claimant wins.
    for (idx, picker) in pickers.iter().enumerate() {
        let mut kept: Vec<ShardRange> = Vec::new();
        let mut budget = target(idx);
        if let Some(prev_ranges) = previous.get(picker.as_str()) {
            for range in prev_ranges {
                let end = range.end.min(shard_count);
                let mut shard = range.start;
                while shard < end && budget > 0 {
                    if taken[shard as usize] {
                        shard += 1;
                        continue;
                    }
                    let start = shard;
                    while shard < end && budget > 0 && !taken[shard as usize] {
                        taken[shard as usize] = true;
                        budget -= 1;
                        shard += 1;
                    }
                    kept.push(ShardRange { start, end: shard });
                }
                if budget == 0 {
                    break;
                }
            }
        }
        assignments.insert((*picker).clone(), kept);
    }

    // Phase 2: hand the free shards, as contiguous runs, to pickers below
    // their target.
    let mut free_runs: Vec<ShardRange> = Vec::new();
    let mut run_start: Option<u32> = None;
    for shard in 0..shard_count {
        if taken[shard as usize] {
            if let Some(start) = run_start.take() {
                free_runs.push(ShardRange { start, end: shard });
            }
        } else if run_start.is_none() {
            run_start = Some(shard);
        }
    }
    if let Some(start) = run_start {
        free_runs.push(ShardRange {
            start,
            end: shard_count,
        });
    }

    let mut run_iter = free_runs.into_iter();
    let mut current = run_iter.next();
    for (idx, picker) in pickers.iter().enumerate() {
        let ranges = assignments.get_mut(picker.as_str()).unwrap();
        let mut have: u32 = ranges.iter().map(ShardRange::len).sum();
        let want = target(idx);
        while have < want {
            let Some(run) = current.as_mut() else { break };
            let take = (want - have).min(run.len());
            ranges.push(ShardRange {
                start: run.start,
                end: run.start + take,
            });
            run.start += take;
            have += take;
            if run.is_empty() {
                current = run_iter.next();
            }
        }
    }

    for ranges in assignments.values_mut() {
        normalize(ranges);
    }
    assignments
}

/// Sort and merge adjacent ranges.
fn normalize(ranges: &mut Vec<ShardRange>) {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<ShardRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}
