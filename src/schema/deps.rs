use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::backup::model::TableDefinition;
use crate::LOG_TARGET;

/// `table -> tables it references`.
pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOrder {
    /// Parents before children. Safe for CREATE and for inserts.
    pub forward: Vec<String>,
    /// `forward` reversed. Safe for DROP.
    pub reverse: Vec<String>,
}

/// Edges from each definition's required and optional references.
pub fn dependencies_from_definitions(definitions: &[TableDefinition]) -> DependencyGraph {
    definitions
        .iter()
        .map(|def| {
            let mut targets: BTreeSet<String> = def
                .optional_references
                .iter()
                .map(|fk| fk.table.clone())
                .collect();
            if let Some(parent) = &def.parent_reference {
                targets.insert(parent.table.clone());
            }
            targets.remove(&def.name);
            (def.name.clone(), targets)
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

enum Step<'a> {
    Descend(&'a str),
    Finish,
}

/// Order `tables` so every table follows the tables it depends on.
///
/// Depth-first with an explicit stack. An edge back into a table that is
/// still being visited closes a cycle; that edge is dropped and the walk
/// carries on, so cycles never fail the ordering. Independent tables keep
/// their order from `tables`. Edges to tables outside `tables` are ignored.
pub fn topo_order(tables: &[String], deps: &DependencyGraph) -> TableOrder {
    let position: HashMap<&str, usize> = tables
        .iter()
        .enumerate()
        .rev()
        .map(|(idx, t)| (t.as_str(), idx))
        .collect();

    let deps_of = |table: &str| -> Vec<&str> {
        let mut targets: Vec<&str> = deps
            .get(table)
            .map(|set| {
                set.iter()
                    .map(String::as_str)
                    .filter(|t| *t != table && position.contains_key(t))
                    .collect()
            })
            .unwrap_or_default();
        targets.sort_by_key(|t| position.get(t).copied().unwrap_or(usize::MAX));
        targets
    };

    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let mut forward = Vec::with_capacity(tables.len());

    for root in tables {
        let root = root.as_str();
        if state.contains_key(root) {
            continue;
        }
        state.insert(root, VisitState::Visiting);
        let mut stack: Vec<(&str, Vec<&str>, usize)> = vec![(root, deps_of(root), 0)];

        while let Some((node, targets, next)) = stack.last_mut() {
            let step = if *next < targets.len() {
                let target = targets[*next];
                *next += 1;
                match state.get(target) {
                    None => Step::Descend(target),
                    Some(VisitState::Visiting) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            event = "fk_cycle_edge_dropped",
                            from = %node,
                            to = %target
                        );
                        continue;
                    }
                    Some(VisitState::Done) => continue,
                }
            } else {
                Step::Finish
            };

            match step {
                Step::Descend(target) => {
                    state.insert(target, VisitState::Visiting);
                    stack.push((target, deps_of(target), 0));
                }
                Step::Finish => {
                    if let Some((node, _, _)) = stack.pop() {
                        state.insert(node, VisitState::Done);
                        forward.push(node.to_string());
                    }
                }
            }
        }
    }

    let reverse = forward.iter().rev().cloned().collect();
    TableOrder { forward, reverse }
}
