use std::collections::BTreeMap;

use crate::error::{FleetError, Result};
use crate::scheduler::shard::WorkShard;

/// Worker index to its ordered shard list. Every worker in `0..worker_count`
/// has an entry, possibly empty.
pub type Assignment = BTreeMap<usize, Vec<WorkShard>>;

/// Split the shards not yet done across `worker_count` workers.
///
/// Remaining shards are sorted by name and dealt round-robin, so the same
/// remaining set and worker count always produce the same assignment no
/// matter how the caller listed them. Shards with the same name are
/// assigned once.
pub fn partition<F>(
    shards: &[WorkShard],
    worker_count: usize,
    already_done: F,
) -> Result<Assignment>
where
    F: Fn(&WorkShard) -> bool,
{
    if worker_count == 0 {
        return Err(FleetError::InvalidArgument(
            "cannot partition across zero workers".to_string(),
        ));
    }

    let mut remaining: Vec<&WorkShard> = shards.iter().filter(|s| !already_done(s)).collect();
    remaining.sort();
    remaining.dedup_by(|a, b| a.name == b.name);

    let mut assignment: Assignment = (0..worker_count).map(|w| (w, Vec::new())).collect();
    for (i, shard) in remaining.into_iter().enumerate() {
        if let Some(list) = assignment.get_mut(&(i % worker_count)) {
            list.push(shard.clone());
        }
    }

    tracing::debug!(
        shards = shards.len(),
        assigned = assignment.values().map(Vec::len).sum::<usize>(),
        workers = worker_count,
        "Partitioned shards"
    );
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(names: &[&str]) -> Vec<WorkShard> {
        names
            .iter()
            .map(|n| WorkShard::from_path(format!("/in/{n}")).unwrap())
            .collect()
    }

    #[test]
    fn round_robin_by_name() {
        let s = shards(&["c.parquet", "a.parquet", "d.parquet", "b.parquet", "e.parquet"]);
        let a = partition(&s, 2, |_| false).unwrap();
        let names = |w: usize| a[&w].iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(0), vec!["a.parquet", "c.parquet", "e.parquet"]);
        assert_eq!(names(1), vec!["b.parquet", "d.parquet"]);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(partition(&shards(&["a.parquet"]), 0, |_| false).is_err());
    }

    #[test]
    fn duplicate_shard_names_assigned_once() {
        let s = shards(&["a.parquet", "a.parquet", "b.parquet"]);
        let a = partition(&s, 3, |_| false).unwrap();
        assert_eq!(a.values().map(Vec::len).sum::<usize>(), 2);
    }
}
