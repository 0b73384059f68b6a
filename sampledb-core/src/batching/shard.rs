// batching/shard.rs
//! Partition a view into disjoint shards for parallel workers
//!
//! Boundaries are `ceil(i * n / k)` for `i` in `0..=k`, where `k` is the
//! realized shard count `max(1, min(workers, n))`. Seven samples over three
//! workers give `[0, 3) [3, 5) [5, 7)`.

use std::str::FromStr;

use serde_json::{json, Value};

use crate::document::ObjectId;
use crate::error::{Result, SampleDbError};
use crate::view::{PipelineOptions, View, ViewStage};

/// How shard membership is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPolicy {
    /// Offset ranges over the view's order
    Slice,
    /// Explicit sample id lists, fetched once
    Ids,
}

impl FromStr for ShardPolicy {
    type Err = SampleDbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slice" => Ok(ShardPolicy::Slice),
            "id" | "ids" => Ok(ShardPolicy::Ids),
            other => Err(SampleDbError::ShardPolicy(other.to_string())),
        }
    }
}

/// Members of one shard
#[derive(Debug, Clone, PartialEq)]
pub enum ShardSpec {
    Range { start: usize, end: usize },
    Ids(Vec<ObjectId>),
}

/// One shard of a partition
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub index: usize,
    /// Number of shards in the partition
    pub count: usize,
    pub spec: ShardSpec,
}

impl Shard {
    pub fn len(&self) -> usize {
        match &self.spec {
            ShardSpec::Range { start, end } => end - start,
            ShardSpec::Ids(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shard's samples as a view over `view`
    pub fn to_view(&self, view: &View) -> Result<View> {
        match &self.spec {
            ShardSpec::Range { start, end } => view
                .add_stage(ViewStage::Skip(*start))?
                .add_stage(ViewStage::Limit((end - start) as i64)),
            ShardSpec::Ids(ids) => view.add_stage(ViewStage::Select(
                ids.iter().map(|id| id.to_hex().to_string()).collect(),
            )),
        }
    }
}

/// `[start, end)` bounds of `max(1, min(workers, n))` contiguous shards
///
/// Boundary `i` is `ceil(i * n / count)`, so earlier shards take the
/// remainder: 7 samples over 3 workers split as `[3, 2, 2]`.
pub fn shard_bounds(n: usize, workers: usize) -> Result<Vec<(usize, usize)>> {
    if workers == 0 {
        return Err(SampleDbError::InvalidQuery(
            "shard worker count must be at least 1".to_string(),
        ));
    }
    let count = workers.min(n).max(1);
    let boundary = |i: usize| (i * n).div_ceil(count);
    Ok((0..count).map(|i| (boundary(i), boundary(i + 1))).collect())
}

/// Partition `view` into shards for `workers` workers
///
/// `policy` is `"slice"` or `"id"`; anything else is a
/// [`SampleDbError::ShardPolicy`] error.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use sampledb_core::batching::{shard, ShardSpec};
/// use sampledb_core::schema::MediaType;
/// use sampledb_core::{Collection, EngineConfig, MemoryStore};
/// use serde_json::json;
///
/// let store = Arc::new(MemoryStore::new());
/// let coll = Collection::new("shards", MediaType::Image, store, EngineConfig::default()).unwrap();
/// coll.add_samples((0..7).map(|i| json!({"filepath": format!("{}.jpg", i)})).collect())
///     .unwrap();
///
/// let shards = shard(&coll.view(), 3, "slice").unwrap();
/// let ranges: Vec<_> = shards.iter().map(|s| s.spec.clone()).collect();
/// assert_eq!(ranges, vec![
///     ShardSpec::Range { start: 0, end: 3 },
///     ShardSpec::Range { start: 3, end: 5 },
///     ShardSpec::Range { start: 5, end: 7 },
/// ]);
/// ```
pub fn shard(view: &View, workers: usize, policy: &str) -> Result<Vec<Shard>> {
    shard_with_policy(view, workers, policy.parse()?)
}

pub fn shard_with_policy(view: &View, workers: usize, policy: ShardPolicy) -> Result<Vec<Shard>> {
    let shards = match policy {
        ShardPolicy::Slice => {
            let n = view.count()? as usize;
            let bounds = shard_bounds(n, workers)?;
            let count = bounds.len();
            bounds
                .into_iter()
                .enumerate()
                .map(|(index, (start, end))| Shard {
                    index,
                    count,
                    spec: ShardSpec::Range { start, end },
                })
                .collect::<Vec<_>>()
        }
        ShardPolicy::Ids => {
            let docs = view.aggregate(&PipelineOptions::new(), &[json!({"$project": {"_id": 1}})])?;
            let ids = docs
                .iter()
                .map(|doc| {
                    doc.get("_id")
                        .and_then(ObjectId::from_value)
                        .ok_or_else(|| SampleDbError::Serialization(format!("Sample without an ObjectId: {}", doc)))
                })
                .collect::<Result<Vec<_>>>()?;
            let bounds = shard_bounds(ids.len(), workers)?;
            let count = bounds.len();
            bounds
                .into_iter()
                .enumerate()
                .map(|(index, (start, end))| Shard {
                    index,
                    count,
                    spec: ShardSpec::Ids(ids[start..end].to_vec()),
                })
                .collect()
        }
    };

    crate::log_debug!(
        "Sharded '{}' into {} shards for {} workers ({:?})",
        view.collection().name(),
        shards.len(),
        workers,
        policy
    );
    Ok(shards)
}

/// Run `work` on every shard on its own scoped thread
///
/// Each worker receives its shard and a view restricted to it. Results are
/// returned in shard order; the first failing shard's error is returned.
pub fn run_sharded<F, R>(view: &View, shards: &[Shard], work: F) -> Result<Vec<R>>
where
    F: Fn(&Shard, View) -> Result<R> + Sync,
    R: Send,
{
    let work = &work;
    let joined = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .iter()
            .map(|shard| {
                scope.spawn(move |_| {
                    let shard_view = shard.to_view(view)?;
                    work(shard, shard_view)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| handle.join().unwrap_or_else(|_| Err(SampleDbError::ShardWorker(i))))
            .collect::<Vec<Result<R>>>()
    });

    match joined {
        Ok(results) => results.into_iter().collect(),
        Err(_) => Err(SampleDbError::ShardWorker(shards.len())),
    }
}

/// Flatten per-shard id lists back into one list
pub fn shard_ids(shards: &[Shard]) -> Vec<Value> {
    shards
        .iter()
        .flat_map(|s| match &s.spec {
            ShardSpec::Ids(ids) => ids.iter().map(ObjectId::to_value).collect(),
            ShardSpec::Range { .. } => Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::collection::Collection;
    use crate::config::EngineConfig;
    use crate::schema::MediaType;
    use crate::store::MemoryStore;

    fn collection(n: usize) -> Collection {
        let store = Arc::new(MemoryStore::new());
        let coll = Collection::new("shards", MediaType::Image, store, EngineConfig::default()).unwrap();
        if n > 0 {
            coll.add_samples((0..n).map(|i| json!({"filepath": format!("{}.jpg", i)})).collect())
                .unwrap();
        }
        coll
    }

    #[test]
    fn test_bounds() {
        assert_eq!(shard_bounds(7, 3).unwrap(), vec![(0, 3), (3, 5), (5, 7)]);
        assert_eq!(shard_bounds(7, 10).unwrap().len(), 7);
        assert_eq!(shard_bounds(0, 4).unwrap(), vec![(0, 0)]);
        assert!(shard_bounds(5, 0).is_err());
    }

    #[test]
    fn test_unknown_policy() {
        let coll = collection(3);
        assert!(matches!(
            shard(&coll.view(), 2, "random"),
            Err(SampleDbError::ShardPolicy(_))
        ));
    }

    #[test]
    fn test_id_policy_covers_view() {
        let coll = collection(7);
        let shards = shard(&coll.view(), 3, "id").unwrap();
        let sizes: Vec<usize> = shards.iter().map(Shard::len).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        let all = shard_ids(&shards);
        let expected: Vec<Value> = coll.sample_ids().unwrap().iter().map(ObjectId::to_value).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_run_sharded_in_order() {
        let coll = collection(7);
        let view = coll.view();
        let shards = shard(&view, 3, "slice").unwrap();
        let counts = run_sharded(&view, &shards, |_, v| v.count()).unwrap();
        assert_eq!(counts, vec![3, 2, 2]);

        let err = run_sharded(&view, &shards, |s, _| -> Result<()> {
            if s.index == 1 {
                panic!("worker failure");
            }
            Ok(())
        });
        assert!(matches!(err, Err(SampleDbError::ShardWorker(1))));
    }
}
