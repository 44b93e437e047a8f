//! Parameter tree flattening.
//!
//! Walks a [`ParameterNode`] tree depth-first (maps in sorted key order,
//! lists by index) and produces one [`ParameterRecord`] per distinct
//! parameter. A parameter met again at another path only gains that path.

use std::collections::HashMap;

use fitview_types::{ParameterId, ParameterRecord};

use crate::format;
use crate::model::{Parameter, ParameterNode, ParameterTable};

/// Flatten `root` into parameter records, in first-occurrence order.
///
/// With `only_fittable`, records are deduplicated over the whole tree first
/// and then those that are not fittable or are fixed are dropped, so a
/// linked parameter is counted once however many paths reference it.
///
/// Leaves whose id is missing from `table` are skipped.
pub fn flatten(root: &ParameterNode, table: &ParameterTable, only_fittable: bool) -> Vec<ParameterRecord> {
    let mut walker = Walker {
        table,
        records: Vec::new(),
        index: HashMap::new(),
    };
    walker.visit(root, &mut Vec::new());

    let mut records = walker.records;
    if only_fittable {
        records.retain(ParameterRecord::is_free);
    }
    records
}

/// Build the display record of one parameter at its first path.
pub fn to_record(parameter: &Parameter, path: String) -> ParameterRecord {
    let (value01, min_str, max_str) = parameter.bounds.map_or((None, None, None), |bounds| {
        (
            Some(bounds.get01(parameter.value)),
            Some(format::format_value(bounds.lo())),
            Some(format::format_value(bounds.hi())),
        )
    });
    ParameterRecord {
        id: parameter.id,
        name: parameter.name.clone(),
        paths: vec![path],
        value_str: format::format_value(parameter.value),
        fittable: parameter.fittable,
        fixed: parameter.fixed,
        writable: parameter.writable(),
        value01,
        min_str,
        max_str,
    }
}

/// Join path segments with `.`, attaching `[i]` index segments directly to
/// the segment before them.
pub fn join_path(segments: &[String]) -> String {
    let mut path = String::new();
    for segment in segments {
        if !path.is_empty() && !segment.starts_with('[') {
            path.push('.');
        }
        path.push_str(segment);
    }
    path
}

struct Walker<'a> {
    table: &'a ParameterTable,
    records: Vec<ParameterRecord>,
    index: HashMap<ParameterId, usize>,
}

impl Walker<'_> {
    fn visit(&mut self, node: &ParameterNode, segments: &mut Vec<String>) {
        match node {
            ParameterNode::Map(children) => {
                for (key, child) in children {
                    segments.push(key.clone());
                    self.visit(child, segments);
                    segments.pop();
                }
            }
            ParameterNode::List(children) => {
                for (i, child) in children.iter().enumerate() {
                    segments.push(format!("[{i}]"));
                    self.visit(child, segments);
                    segments.pop();
                }
            }
            ParameterNode::Leaf(id) => self.leaf(*id, join_path(segments)),
        }
    }

    fn leaf(&mut self, id: ParameterId, path: String) {
        if let Some(record) = self.index.get(&id).and_then(|i| self.records.get_mut(*i)) {
            record.paths.push(path);
            return;
        }
        let Some(parameter) = self.table.get(id) else {
            tracing::debug!(parameter_id = %id, path = %path, "Skipping leaf with no parameter");
            return;
        };
        self.index.insert(id, self.records.len());
        self.records.push(to_record(parameter, path));
    }
}
