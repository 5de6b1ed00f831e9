//! Dependency ordering for modules and bundles.
//!
//! [`resolve`] is a depth-first topological sort with three-color marking.
//! Each root is taken in input order; visiting a node first visits its
//! dependencies in their declared order and then emits the node. This makes
//! the output deterministic and close to the input order:
//!
//! ```text
//! input:  A→[B,C]  B→[D]  C→[D]  D
//! output: D B C A
//! ```
//!
//! Items the caller did not pass in are *missing*: they are recorded in the
//! [`Resolution`] and otherwise skipped. A node reached again while still in
//! progress is a cycle, which is always an error.
//!
//! Callers control tie-breaking by pre-sorting the input; [`entry_last_key`]
//! is the conventional key, placing `__main__` items after everything else.

use std::collections::HashMap;

use crate::error::ResolveError;

/// Namespace of application entry modules; these sort last.
pub const MAIN_NAMESPACE: &str = "__main__";

/// Anything with a name and an ordered list of dependency names.
pub trait Dependent {
    /// Unique name within one resolution.
    fn name(&self) -> &str;

    /// Names this item depends on, in declared order.
    fn deps(&self) -> &[String];
}

impl<T: Dependent + ?Sized> Dependent for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn deps(&self) -> &[String] {
        (**self).deps()
    }
}

/// A dependency name that was not part of the resolution input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    /// Item that declared the dependency
    pub item: String,
    /// Name that could not be found
    pub dependency: String,
}

/// Output of [`resolve`].
#[derive(Debug)]
pub struct Resolution<'a, T> {
    /// Every input item, dependencies first
    pub order: Vec<&'a T>,
    /// One entry per missing dependency occurrence
    pub missing: Vec<MissingDependency>,
}

impl<T: Dependent> Resolution<'_, T> {
    /// Names in resolved order.
    pub fn names(&self) -> Vec<String> {
        self.order.iter().map(|item| item.name().to_string()).collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Order `items` so that every item comes after the dependencies that are
/// also in `items`.
///
/// O(V+E). The input slice is not modified.
///
/// # Errors
///
/// - `ResolveError::DuplicateName` if two items share a name
/// - `ResolveError::Cycle` if the graph restricted to `items` has a cycle,
///   including an item that depends on itself
pub fn resolve<T: Dependent>(items: &[T]) -> Result<Resolution<'_, T>, ResolveError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if index.insert(item.name(), i).is_some() {
            return Err(ResolveError::DuplicateName(item.name().to_string()));
        }
    }

    let mut marks = vec![Mark::Unvisited; items.len()];
    let mut order = Vec::with_capacity(items.len());
    let mut missing = Vec::new();
    // (node, next dependency position)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..items.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            top.1 += 1;

            let deps = items[node].deps();
            let Some(dep) = deps.get(pos) else {
                marks[node] = Mark::Done;
                order.push(&items[node]);
                stack.pop();
                continue;
            };

            match index.get(dep.as_str()) {
                None => missing.push(MissingDependency {
                    item: items[node].name().to_string(),
                    dependency: dep.clone(),
                }),
                Some(&next) => match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    },
                    Mark::InProgress => {
                        let start = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|&(n, _)| items[n].name().to_string()).collect();
                        path.push(items[next].name().to_string());
                        return Err(ResolveError::Cycle { path });
                    },
                    Mark::Done => {},
                },
            }
        }
    }

    Ok(Resolution { order, missing })
}

/// Sort key that keeps names in order but moves [`MAIN_NAMESPACE`] items
/// to the end.
pub fn entry_last_key(name: &str) -> (bool, &str) {
    (name.starts_with(MAIN_NAMESPACE), name)
}

/// Sort `items` by [`entry_last_key`].
pub fn sort_entry_last<T: Dependent>(items: &mut [T]) {
    items.sort_by(|a, b| entry_last_key(a.name()).cmp(&entry_last_key(b.name())));
}
