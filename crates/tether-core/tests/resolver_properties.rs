//! Property-based tests for dependency resolution.
//!
//! Graphs are generated acyclic by construction: item `m{i}` only depends on
//! items with a lower index, and the input order is a random permutation.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use tether_core::{Dependent, ResolveError, resolve};

#[derive(Debug, Clone)]
struct Item {
    name: String,
    deps: Vec<String>,
}

impl Dependent for Item {
    fn name(&self) -> &str {
        &self.name
    }

    fn deps(&self) -> &[String] {
        &self.deps
    }
}

fn name(i: usize) -> String {
    format!("m{i}")
}

/// Random DAG over `1..16` items, shuffled.
fn arbitrary_dag() -> impl Strategy<Value = Vec<Item>> {
    (1usize..16)
        .prop_flat_map(|n| {
            let deps: Vec<_> = (0..n).map(|i| prop::collection::btree_set(0..i.max(1), 0..=i.min(4))).collect();
            (deps, Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
        })
        .prop_map(|(deps, order)| {
            order
                .into_iter()
                .map(|i| Item { name: name(i), deps: deps[i].iter().filter(|&&d| d < i).map(|&d| name(d)).collect() })
                .collect()
        })
}

/// Smallest input position among `name` and everything that transitively
/// depends on it.
fn first_reacher(items: &[Item], target: &str) -> usize {
    let index: HashMap<&str, usize> = items.iter().enumerate().map(|(i, item)| (item.name.as_str(), i)).collect();
    (0..items.len())
        .filter(|&root| {
            let mut seen = HashSet::new();
            let mut stack = vec![root];
            while let Some(i) = stack.pop() {
                if items[i].name == target {
                    return true;
                }
                if seen.insert(i) {
                    stack.extend(items[i].deps.iter().filter_map(|d| index.get(d.as_str()).copied()));
                }
            }
            false
        })
        .min()
        .unwrap_or(usize::MAX)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Every item appears once, after all of its dependencies
    #[test]
    fn prop_dependencies_come_first(items in arbitrary_dag()) {
        let resolution = resolve(&items).unwrap();
        let names = resolution.names();

        prop_assert_eq!(names.len(), items.len());
        let position: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        prop_assert_eq!(position.len(), items.len());
        for item in &items {
            for dep in &item.deps {
                prop_assert!(position[dep.as_str()] < position[item.name.as_str()], "{} before {}", dep, item.name);
            }
        }
        prop_assert!(resolution.missing.is_empty());
    }

    /// Property: Output is grouped by the first input item that reaches each
    /// node, so it stays as close to input order as the constraints allow
    #[test]
    fn prop_output_follows_input_order(items in arbitrary_dag()) {
        let names = resolve(&items).unwrap().names();
        let reach: Vec<usize> = names.iter().map(|n| first_reacher(&items, n)).collect();

        for pair in reach.windows(2) {
            prop_assert!(pair[0] <= pair[1], "reach order {:?} for {:?}", reach, names);
        }
    }

    /// Property: Resolving twice yields the same order
    #[test]
    fn prop_deterministic(items in arbitrary_dag()) {
        prop_assert_eq!(resolve(&items).unwrap().names(), resolve(&items).unwrap().names());
    }

    /// Property: Any back edge is reported as a closed cycle path
    #[test]
    fn prop_cycles_are_reported(mut items in arbitrary_dag(), a in any::<prop::sample::Index>(), b in any::<prop::sample::Index>()) {
        let a = a.index(items.len());
        let b = b.index(items.len());
        let (name_a, name_b) = (items[a].name.clone(), items[b].name.clone());
        items[a].deps.push(name_b);
        items[b].deps.push(name_a);

        match resolve(&items) {
            Err(ResolveError::Cycle { path }) => {
                prop_assert!(path.len() >= 2);
                prop_assert_eq!(path.first(), path.last());
            },
            other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|r| r.names())),
        }
    }

    /// Property: Unknown dependency names are recorded and otherwise skipped
    #[test]
    fn prop_missing_dependencies_are_recorded(
        mut items in arbitrary_dag(),
        target in any::<prop::sample::Index>(),
        extra in "[A-Z]{1,4}",
    ) {
        let target = target.index(items.len());
        items[target].deps.push(extra.clone());

        let resolution = resolve(&items).unwrap();
        prop_assert_eq!(resolution.order.len(), items.len());
        prop_assert_eq!(resolution.missing.len(), 1);
        prop_assert_eq!(&resolution.missing[0].item, &items[target].name);
        prop_assert_eq!(&resolution.missing[0].dependency, &extra);
    }
}

#[test]
fn diamond_example() {
    let item = |name: &str, deps: &[&str]| Item {
        name: name.to_string(),
        deps: deps.iter().map(|d| (*d).to_string()).collect(),
    };
    let items = [item("A", &["B", "C"]), item("B", &["D"]), item("C", &["D"]), item("D", &[])];
    assert_eq!(resolve(&items).unwrap().names(), ["D", "B", "C", "A"]);

    let dup = [item("A", &[]), item("A", &[])];
    assert_eq!(resolve(&dup).unwrap_err(), ResolveError::DuplicateName("A".into()));
}
