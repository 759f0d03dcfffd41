//! Stable topological sort.
//!
//! Used to order dependency `$PATH` entries and profile links
//! deterministically: the output respects every "after" constraint, and any
//! two items with no constraint between them keep their relative input
//! order. Repeated runs over the same input always produce the same output.

use thiserror::Error;

/// Errors from `stable_topological_sort`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SortError {
  #[error("\"{0}\" appears twice in input")]
  DuplicateId(String),

  #[error("\"{0}\" is constrained against unknown item \"{1}\"")]
  UnknownReference(String, String),

  #[error("ordering constraints form a cycle through \"{0}\"")]
  Cycle(String),
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
  Unvisited,
  InProgress,
  Done,
}

/// Sort `items` so that each item comes after everything its `after_of` list
/// names.
///
/// The algorithm is a depth-first emission: roots are taken in original input
/// order, and a node's "after" dependencies are visited (in their input
/// order) before the node itself is emitted. A node already on the recursion
/// stack means the constraints are cyclic.
pub fn stable_topological_sort<T>(
  items: Vec<T>,
  id_of: impl Fn(&T) -> &str,
  after_of: impl Fn(&T) -> &[String],
) -> Result<Vec<T>, SortError> {
  let n = items.len();
  let mut position = std::collections::HashMap::with_capacity(n);
  for (i, item) in items.iter().enumerate() {
    let id = id_of(item);
    if position.insert(id.to_string(), i).is_some() {
      return Err(SortError::DuplicateId(id.to_string()));
    }
  }

  // Resolve each item's constraints to input positions, sorted by position
  // so that sibling order stays tied to the input.
  let mut after_positions: Vec<Vec<usize>> = Vec::with_capacity(n);
  for item in &items {
    let mut deps = Vec::new();
    for dep_id in after_of(item) {
      let pos = *position.get(dep_id).ok_or_else(|| {
        SortError::UnknownReference(id_of(item).to_string(), dep_id.clone())
      })?;
      deps.push(pos);
    }
    deps.sort_unstable();
    after_positions.push(deps);
  }

  let mut marks = vec![Mark::Unvisited; n];
  let mut order = Vec::with_capacity(n);

  fn visit<T>(
    pos: usize,
    items: &[T],
    after_positions: &[Vec<usize>],
    marks: &mut [Mark],
    order: &mut Vec<usize>,
    id_of: &impl Fn(&T) -> &str,
  ) -> Result<(), SortError> {
    match marks[pos] {
      Mark::Done => return Ok(()),
      Mark::InProgress => return Err(SortError::Cycle(id_of(&items[pos]).to_string())),
      Mark::Unvisited => {}
    }
    marks[pos] = Mark::InProgress;
    for &dep in &after_positions[pos] {
      visit(dep, items, after_positions, marks, order, id_of)?;
    }
    marks[pos] = Mark::Done;
    order.push(pos);
    Ok(())
  }

  for pos in 0..n {
    visit(pos, &items, &after_positions, &mut marks, &mut order, &id_of)?;
  }

  let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
  Ok(
    order
      .into_iter()
      .map(|pos| slots[pos].take().expect("each position emitted once"))
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  type Item = (&'static str, Vec<String>);

  fn item(id: &'static str, after: &[&str]) -> Item {
    (id, after.iter().map(|s| s.to_string()).collect())
  }

  fn sort(items: Vec<Item>) -> Result<Vec<&'static str>, SortError> {
    stable_topological_sort(items, |it| it.0, |it| &it.1).map(|v| v.into_iter().map(|it| it.0).collect())
  }

  #[test]
  fn unconstrained_input_keeps_order() {
    let got = sort(vec![item("c", &[]), item("a", &[]), item("b", &[])]).unwrap();
    assert_eq!(got, vec!["c", "a", "b"]);
  }

  #[test]
  fn dependencies_come_first() {
    let got = sort(vec![
      item("space-suit", &["sweater", "socks", "underwear"]),
      item("sweater", &["t-shirt"]),
      item("t-shirt", &[]),
      item("shoes", &[]),
      item("underwear", &[]),
      item("socks", &[]),
    ])
    .unwrap();
    assert_eq!(got, vec!["t-shirt", "sweater", "underwear", "socks", "space-suit", "shoes"]);
  }

  #[test]
  fn sibling_swap_only_swaps_siblings() {
    // underwear and socks have no constraint between them; swapping their
    // input positions swaps them in the output and changes nothing else
    let got = sort(vec![
      item("space-suit", &["sweater", "socks", "underwear"]),
      item("sweater", &["t-shirt"]),
      item("t-shirt", &[]),
      item("shoes", &[]),
      item("socks", &[]),
      item("underwear", &[]),
    ])
    .unwrap();
    assert_eq!(got, vec!["t-shirt", "sweater", "socks", "underwear", "space-suit", "shoes"]);
  }

  #[test]
  fn output_respects_every_constraint() {
    let items = vec![
      item("d", &["b", "c"]),
      item("b", &["a"]),
      item("c", &["a"]),
      item("a", &[]),
    ];
    let got = sort(items).unwrap();
    let pos = |id: &str| got.iter().position(|&x| x == id).unwrap();
    assert!(pos("a") < pos("b"));
    assert!(pos("a") < pos("c"));
    assert!(pos("b") < pos("d"));
    assert!(pos("c") < pos("d"));
  }

  #[test]
  fn two_cycle_is_detected() {
    let err = sort(vec![item("x", &["y"]), item("y", &["x"])]).unwrap_err();
    assert!(matches!(err, SortError::Cycle(_)));
  }

  #[test]
  fn longer_cycle_is_detected() {
    let err = sort(vec![item("x", &["y"]), item("y", &["z"]), item("z", &["x"])]).unwrap_err();
    assert!(matches!(err, SortError::Cycle(_)));
  }

  #[test]
  fn self_cycle_is_detected() {
    let err = sort(vec![item("x", &["x"])]).unwrap_err();
    assert!(matches!(err, SortError::Cycle(_)));
  }

  #[test]
  fn duplicate_id_is_rejected() {
    let err = sort(vec![item("a", &[]), item("b", &[]), item("a", &[])]).unwrap_err();
    assert_eq!(err, SortError::DuplicateId("a".to_string()));
  }

  #[test]
  fn unknown_reference_is_rejected() {
    let err = sort(vec![item("a", &["ghost"])]).unwrap_err();
    assert_eq!(err, SortError::UnknownReference("a".to_string(), "ghost".to_string()));
  }

  #[test]
  fn empty_input() {
    assert_eq!(sort(vec![]).unwrap(), Vec::<&str>::new());
  }
}
