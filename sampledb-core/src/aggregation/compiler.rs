// aggregation/compiler.rs
//! Round-trip planning for batches of aggregation requests
//!
//! ```text
//! requests ──resolve──► Batchable ──► one $project per group slice
//!                   ├──► BigResult ──► one pipeline each
//!                   └──► Facetable ──► grouped by document-list root
//!                                      └─► one $facet per group
//! ```
//!
//! Round-trips = (1 if any batchable) + |big-result| + |facet groups|.
//! A request with no field joins the root group (`""`, or `"frames"` for
//! frame paths without a document list). Every request keeps its own facet
//! branch; the longest stage prefix shared by all branches of a group is
//! hoisted in front of the `$facet`.

use serde_json::{json, Map, Value};

use super::{AggregationRequest, ExecutionClass};
use crate::aggregation::AggregationResult;
use crate::error::{Result, SampleDbError};
use crate::path::{resolve_path, ResolvedPath};
use crate::schema::SchemaCatalog;
use crate::view::{PipelineOptions, View};

/// A request with its field resolved against the view's schema
struct Prepared<'a> {
    index: usize,
    request: &'a AggregationRequest,
    resolved: Option<ResolvedPath>,
}

impl Prepared<'_> {
    fn is_frame_field(&self) -> bool {
        self.resolved.as_ref().map(|r| r.is_frame_field).unwrap_or(false)
    }

    fn group_slice(&self) -> Option<String> {
        self.resolved.as_ref().and_then(|r| r.group_slice.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FacetKey {
    root: String,
    group_slice: Option<String>,
}

/// Requests split by execution class, in request order
#[derive(Default)]
struct Plan<'a> {
    batches: Vec<(Option<String>, Vec<Prepared<'a>>)>,
    big: Vec<Prepared<'a>>,
    facets: Vec<(FacetKey, Vec<Prepared<'a>>)>,
}

impl Plan<'_> {
    fn round_trips(&self) -> usize {
        self.batches.len() + self.big.len() + self.facets.len()
    }
}

fn facet_key(prepared: &Prepared<'_>, schema: &SchemaCatalog) -> FacetKey {
    let root = match &prepared.resolved {
        Some(resolved) => resolved
            .document_list_root(schema)
            .unwrap_or_else(|| if resolved.is_frame_field { "frames".to_string() } else { String::new() }),
        None => String::new(),
    };
    FacetKey {
        root,
        group_slice: prepared.group_slice(),
    }
}

fn resolve<'a>(
    view: &View,
    schema: &SchemaCatalog,
    cached: bool,
    strict: bool,
    index: usize,
    request: &'a AggregationRequest,
) -> Result<Prepared<'a>> {
    request.check_target()?;
    let resolved = match request.field() {
        Some(field) => {
            let options = request.resolve_options(strict);
            if cached {
                view.collection().resolve_path(field, &options)?
            } else {
                resolve_path(schema, field, &options)?
            }
        }
        None => None,
    };
    Ok(Prepared {
        index,
        request,
        resolved,
    })
}

/// Longest stage prefix shared by every branch
fn common_prefix(branches: &[Vec<Value>]) -> usize {
    let Some(first) = branches.first() else {
        return 0;
    };
    let mut len = 0;
    while len < first.len() && branches.iter().all(|b| b.get(len) == Some(&first[len])) {
        len += 1;
    }
    len
}

/// Run `requests` over `view`, one result per request
///
/// Failures are confined to the round-trip they occur in: requests of other
/// round-trips still get their results.
pub fn run_aggregations_partial(
    view: &View,
    requests: &[AggregationRequest],
) -> Vec<Result<AggregationResult>> {
    let mut results: Vec<Option<Result<AggregationResult>>> = requests.iter().map(|_| None).collect();
    let schema = view.schema();
    let strict = view.collection().config().strict_fields;
    let cached = !view.stages().iter().any(|s| s.transforms_schema());

    let mut plan = Plan::default();
    for (index, request) in requests.iter().enumerate() {
        let prepared = match resolve(view, &schema, cached, strict, index, request) {
            Ok(p) => p,
            Err(e) => {
                results[index] = Some(Err(e));
                continue;
            }
        };
        match request.execution_class(prepared.resolved.as_ref()) {
            ExecutionClass::Batchable => {
                let slice = prepared.group_slice();
                match plan.batches.iter_mut().find(|(s, _)| *s == slice) {
                    Some((_, members)) => members.push(prepared),
                    None => plan.batches.push((slice, vec![prepared])),
                }
            }
            ExecutionClass::BigResult => plan.big.push(prepared),
            ExecutionClass::Facetable => {
                let key = facet_key(&prepared, &schema);
                match plan.facets.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, members)) => members.push(prepared),
                    None => plan.facets.push((key, vec![prepared])),
                }
            }
        }
    }

    crate::log_debug!(
        "Compiled {} aggregations into {} round-trips ({} batched, {} big, {} facet groups)",
        requests.len(),
        plan.round_trips(),
        plan.batches.iter().map(|(_, m)| m.len()).sum::<usize>(),
        plan.big.len(),
        plan.facets.len()
    );

    for (slice, members) in &plan.batches {
        run_batch(view, slice.clone(), members, &mut results);
    }
    for prepared in &plan.big {
        run_big(view, &schema, prepared, &mut results);
    }
    for (key, members) in &plan.facets {
        run_facet(view, &schema, key, members, &mut results);
    }

    results
        .into_iter()
        .map(|r| {
            r.unwrap_or_else(|| {
                Err(SampleDbError::AggregationError(
                    "aggregation was not executed".to_string(),
                ))
            })
        })
        .collect()
}

/// Run `requests` over `view`; the first failure is returned after every
/// round-trip has run
pub fn run_aggregations(view: &View, requests: &[AggregationRequest]) -> Result<Vec<AggregationResult>> {
    run_aggregations_partial(view, requests).into_iter().collect()
}

fn options_for(members: &[Prepared<'_>], group_slice: Option<String>) -> PipelineOptions {
    PipelineOptions::new()
        .with_frames(members.iter().any(Prepared::is_frame_field))
        .with_group_slice(group_slice)
}

/// Record a failed round-trip against every request it carried
fn fail_all(indices: &[usize], err: SampleDbError, results: &mut [Option<Result<AggregationResult>>]) {
    crate::log_warn!("Aggregation round-trip failed for {} request(s): {}", indices.len(), err);
    let message = err.to_string();
    let mut err = Some(err);
    for &index in indices {
        let e = err
            .take()
            .unwrap_or_else(|| SampleDbError::AggregationError(message.clone()));
        results[index] = Some(Err(e));
    }
}

fn run_batch(
    view: &View,
    group_slice: Option<String>,
    members: &[Prepared<'_>],
    results: &mut [Option<Result<AggregationResult>>],
) {
    let mut project = Map::new();
    project.insert("_id".to_string(), json!(0));
    for (i, prepared) in members.iter().enumerate() {
        project.insert(
            format!("a{}", i),
            prepared.request.value_expression(prepared.resolved.as_ref()),
        );
    }

    let options = options_for(members, group_slice);
    match view.aggregate(&options, &[json!({"$project": project})]) {
        Ok(docs) => {
            for (i, prepared) in members.iter().enumerate() {
                let result = prepared
                    .request
                    .parse_batched(prepared.resolved.as_ref(), &format!("a{}", i), &docs);
                results[prepared.index] = Some(Ok(result));
            }
        }
        Err(e) => {
            let indices: Vec<usize> = members.iter().map(|p| p.index).collect();
            fail_all(&indices, e, results);
        }
    }
}

fn run_big(
    view: &View,
    schema: &SchemaCatalog,
    prepared: &Prepared<'_>,
    results: &mut [Option<Result<AggregationResult>>],
) {
    let resolved = prepared.resolved.as_ref();
    let outcome = prepared.request.pipeline(resolved).and_then(|extra| {
        let options = options_for(std::slice::from_ref(prepared), prepared.group_slice());
        let docs = view.aggregate(&options, &extra)?;
        prepared.request.parse(resolved, schema, docs)
    });
    results[prepared.index] = Some(outcome);
}

fn run_facet(
    view: &View,
    schema: &SchemaCatalog,
    key: &FacetKey,
    members: &[Prepared<'_>],
    results: &mut [Option<Result<AggregationResult>>],
) {
    // Lowering errors stay with their own request
    let mut branches = Vec::with_capacity(members.len());
    let mut lowered = Vec::with_capacity(members.len());
    for prepared in members {
        match prepared.request.pipeline(prepared.resolved.as_ref()) {
            Ok(branch) => {
                branches.push(branch);
                lowered.push(prepared);
            }
            Err(e) => results[prepared.index] = Some(Err(e)),
        }
    }
    if lowered.is_empty() {
        return;
    }

    let options = PipelineOptions::new()
        .with_frames(lowered.iter().any(|p| p.is_frame_field()))
        .with_group_slice(key.group_slice.clone());

    if lowered.len() == 1 {
        let prepared = lowered[0];
        let outcome = view.aggregate(&options, &branches[0]).and_then(|docs| {
            prepared
                .request
                .parse(prepared.resolved.as_ref(), schema, docs)
        });
        results[prepared.index] = Some(outcome);
        return;
    }

    // Every branch keeps at least one stage of its own
    let shortest = branches.iter().map(Vec::len).min().unwrap_or(0);
    let shared = common_prefix(&branches).min(shortest.saturating_sub(1));
    let mut extra: Vec<Value> = branches[0][..shared].to_vec();
    let mut facet = Map::new();
    for (i, branch) in branches.iter().enumerate() {
        facet.insert(i.to_string(), Value::Array(branch[shared..].to_vec()));
    }
    extra.push(json!({"$facet": facet}));

    crate::log_debug!(
        "Facet group '{}' runs {} branches ({} shared stages)",
        key.root,
        lowered.len(),
        shared
    );

    let docs = match view.aggregate(&options, &extra) {
        Ok(docs) => docs,
        Err(e) => {
            let indices: Vec<usize> = lowered.iter().map(|p| p.index).collect();
            fail_all(&indices, e, results);
            return;
        }
    };
    let row = docs.into_iter().next().unwrap_or(Value::Null);

    for (i, prepared) in lowered.iter().enumerate() {
        let branch_docs = match row.get(i.to_string()) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        results[prepared.index] = Some(
            prepared
                .request
                .parse(prepared.resolved.as_ref(), schema, branch_docs),
        );
    }
}
