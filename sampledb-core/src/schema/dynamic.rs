// schema/dynamic.rs
//! Dynamic schema introspection
//!
//! Each round runs one `Schema` request per frontier path and one
//! `ListSchema` request per newly found list field, all through the
//! aggregation compiler. Newly found embedded documents form the next
//! frontier. The scan stops when the frontier is empty or after `max_depth`
//! rounds; in the latter case the unexplored paths are returned so a caller
//! can continue from them.

use std::collections::BTreeMap;

use crate::aggregation::{run_aggregations, AggregationRequest};
use crate::error::Result;
use crate::schema::ObservedTypes;
use crate::view::View;

/// Undeclared fields found in a view's documents
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicSchema {
    /// Observed types per full path (frame paths carry `frames.`)
    pub fields: BTreeMap<String, ObservedTypes>,
    /// Whether every discovered embedded document was explored
    pub complete: bool,
    /// Paths left to explore when `complete` is false
    pub frontier: Vec<String>,
}

impl DynamicSchema {
    pub fn get(&self, path: &str) -> Option<&ObservedTypes> {
        self.fields.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A path to scan: the query path (with `[]` markers for undeclared lists)
/// and the clean path results are reported under
#[derive(Debug, Clone, PartialEq)]
struct Target {
    query: String,
    clean: String,
}

impl Target {
    fn root() -> Self {
        Target {
            query: String::new(),
            clean: String::new(),
        }
    }

    fn declared(path: &str) -> Self {
        Target {
            query: path.to_string(),
            clean: path.replace("[]", ""),
        }
    }

    fn child(&self, name: &str) -> Target {
        let join = |base: &str| {
            if base.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", base, name)
            }
        };
        Target {
            query: join(&self.query),
            clean: join(&self.clean),
        }
    }

    fn unwound(mut self) -> Target {
        self.query.push_str("[]");
        self
    }

    fn request(&self) -> AggregationRequest {
        let field = if self.query.is_empty() {
            None
        } else {
            Some(self.query.as_str())
        };
        AggregationRequest::schema(field, true)
    }
}

/// Scan `view` for undeclared fields
///
/// `paths` restricts the scan to the given embedded paths; by default the
/// document roots and every declared embedded document are scanned. Unless
/// `recursive`, newly found embedded documents are returned as the frontier
/// instead of being explored. `max_depth` defaults to
/// `EngineConfig::introspection_max_depth`.
pub fn get_dynamic_schema(
    view: &View,
    paths: Option<&[String]>,
    recursive: bool,
    max_depth: Option<usize>,
) -> Result<DynamicSchema> {
    let max_depth = max_depth.unwrap_or(view.collection().config().introspection_max_depth);
    let mut frontier: Vec<Target> = match paths {
        Some(paths) => paths.iter().map(|p| Target::declared(p)).collect(),
        None => {
            let schema = view.schema();
            let mut targets = vec![Target::root()];
            if schema.has_frames() {
                targets.push(Target::declared("frames"));
            }
            targets.extend(schema.embedded_paths().iter().map(|p| Target::declared(p)));
            targets
        }
    };

    let mut fields: BTreeMap<String, ObservedTypes> = BTreeMap::new();
    let mut rounds = 0;

    while !frontier.is_empty() && rounds < max_depth {
        rounds += 1;
        let requests: Vec<AggregationRequest> = frontier.iter().map(Target::request).collect();
        let results = run_aggregations(view, &requests)?;

        let mut discovered: Vec<(Target, ObservedTypes)> = Vec::new();
        for (target, result) in frontier.iter().zip(results) {
            let Some(found) = result.into_schema() else {
                continue;
            };
            for (name, types) in found {
                discovered.push((target.child(&name), types));
            }
        }

        // Element types of every new list field in one more round-trip batch
        let lists: Vec<usize> = discovered
            .iter()
            .enumerate()
            .filter(|(_, (_, types))| types.contains_list())
            .map(|(i, _)| i)
            .collect();
        if !lists.is_empty() {
            let requests: Vec<AggregationRequest> = lists
                .iter()
                .map(|&i| AggregationRequest::list_schema(&discovered[i].0.query))
                .collect();
            let results = run_aggregations(view, &requests)?;
            for (&i, result) in lists.iter().zip(results) {
                if let Some(element) = result.into_list_schema() {
                    match element.as_single() {
                        Some(single) => discovered[i].1.set_list_element(single.clone()),
                        None if element.is_empty() => {}
                        None => crate::log_debug!(
                            "List field '{}' holds {} element types",
                            discovered[i].0.clean,
                            element.0.len()
                        ),
                    }
                }
            }
        }

        let mut next = Vec::new();
        for (target, types) in discovered {
            let is_new = !fields.contains_key(&target.clean);
            let embedded_list = types
                .0
                .iter()
                .any(|d| d.is_list() && d.element().map(|e| e.is_embedded()).unwrap_or(false));
            if is_new && embedded_list {
                next.push(target.clone().unwound());
            } else if is_new && types.contains_embedded() {
                next.push(target.clone());
            }
            fields.entry(target.clean).or_default().merge(types);
        }

        crate::log_debug!(
            "Dynamic schema round {} found {} fields, {} to explore",
            rounds,
            fields.len(),
            next.len()
        );
        frontier = next;
        if !recursive {
            break;
        }
    }

    let complete = frontier.is_empty();
    if !complete {
        crate::log_info!(
            "Dynamic schema scan stopped after {} rounds with {} unexplored paths",
            rounds,
            frontier.len()
        );
    }
    Ok(DynamicSchema {
        fields,
        complete,
        frontier: frontier.into_iter().map(|t| t.clean).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::collection::Collection;
    use crate::config::EngineConfig;
    use crate::schema::{labels, FieldDescriptor, MediaType, ScalarKind};
    use crate::store::MemoryStore;

    fn collection() -> Collection {
        let store = Arc::new(MemoryStore::new());
        let coll = Collection::new("dyn", MediaType::Image, store, EngineConfig::default()).unwrap();
        coll.add_sample_field("gt", labels::detections()).unwrap();
        coll.add_samples(vec![
            json!({"filepath": "a.jpg", "flag": true, "info": {"w": 640, "camera": {"make": "x"}},
                   "gt": {"_cls": "Detections", "detections": [
                       {"_cls": "Detection", "label": "cat", "iscrowd": 0}]}}),
            json!({"filepath": "b.jpg", "flag": "yes", "info": {"w": 320.5}}),
        ])
        .unwrap();
        coll
    }

    #[test]
    fn test_target_paths() {
        let root = Target::root();
        let child = root.child("points").unwound().child("x");
        assert_eq!(child.query, "points[].x");
        assert_eq!(child.clean, "points.x");
    }

    #[test]
    fn test_single_round_reports_frontier() {
        let coll = collection();
        let schema = get_dynamic_schema(&coll.view(), None, false, None).unwrap();
        assert_eq!(schema.fields["flag"].0.len(), 2);
        assert_eq!(
            schema.fields["gt.detections.iscrowd"].as_single(),
            Some(&FieldDescriptor::scalar(ScalarKind::Int))
        );
        assert!(schema.fields.contains_key("info"));
        assert!(!schema.fields.contains_key("info.w"));
        assert!(!schema.complete);
        assert_eq!(schema.frontier, vec!["info".to_string()]);
    }

    #[test]
    fn test_recursive_scan_reaches_fixed_point() {
        let coll = collection();
        let schema = get_dynamic_schema(&coll.view(), None, true, None).unwrap();
        assert!(schema.complete);
        assert_eq!(
            schema.fields["info.w"].as_single(),
            Some(&FieldDescriptor::scalar(ScalarKind::Float))
        );
        assert!(schema.fields.contains_key("info.camera.make"));
    }

    #[test]
    fn test_depth_bound() {
        let coll = collection();
        let schema = get_dynamic_schema(&coll.view(), None, true, Some(2)).unwrap();
        assert!(schema.fields.contains_key("info.w"));
        assert!(!schema.fields.contains_key("info.camera.make"));
        assert!(!schema.complete);
        assert_eq!(schema.frontier, vec!["info.camera".to_string()]);
    }
}
