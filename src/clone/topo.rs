use std::collections::{BTreeSet, HashMap};

/// Copy order over the foreign-key graph of the cloned tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOrder {
    /// Indices into the input, referenced tables first.
    pub order: Vec<usize>,
    /// Tables left on a cycle. They follow the sorted ones in input order,
    /// so their rows may still violate foreign keys during the copy.
    pub cyclic: Vec<usize>,
}

/// Kahn's algorithm over `(table, depends_on)` pairs. Edges to tables not in
/// the input and self references are ignored. Ties go to the lower input
/// index, so the order is deterministic.
pub fn copy_order<'a, I>(tables: I) -> CopyOrder
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let tables: Vec<(&str, &[String])> = tables.into_iter().collect();
    let index: HashMap<&str, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (*name, i))
        .collect();

    let mut in_degree = vec![0usize; tables.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];
    for (i, (_, depends_on)) in tables.iter().enumerate() {
        let edges: BTreeSet<usize> = depends_on
            .iter()
            .filter_map(|name| index.get(name.as_str()).copied())
            .filter(|&dep| dep != i)
            .collect();
        for dep in edges {
            in_degree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..tables.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(tables.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    let cyclic: Vec<usize> = (0..tables.len()).filter(|&i| in_degree[i] > 0).collect();
    order.extend(&cyclic);
    CopyOrder { order, cyclic }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(tables: &[(&str, Vec<String>)]) -> CopyOrder {
        copy_order(tables.iter().map(|(name, deps)| (*name, deps.as_slice())))
    }

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_referenced_tables_first() {
        // Alphabetical input, as introspection returns it
        let tables = [
            ("order_items", deps(&["orders", "products"])),
            ("orders", deps(&["users"])),
            ("products", deps(&[])),
            ("users", deps(&[])),
        ];
        let result = order(&tables);

        let names: Vec<&str> = result.order.iter().map(|&i| tables[i].0).collect();
        assert_eq!(names, vec!["products", "users", "orders", "order_items"]);
        assert!(result.cyclic.is_empty());
    }

    #[test]
    fn test_ignores_self_and_external_references() {
        let tables = [
            ("categories", deps(&["categories"])),
            ("audit", deps(&["outside_table"])),
        ];
        let result = order(&tables);
        assert_eq!(result.order, vec![0, 1]);
        assert!(result.cyclic.is_empty());
    }

    #[test]
    fn test_cycle_falls_back_to_input_order() {
        let tables = [
            ("a", deps(&["b"])),
            ("b", deps(&["a"])),
            ("c", deps(&[])),
            ("d", deps(&["a"])),
        ];
        let result = order(&tables);

        assert_eq!(result.order, vec![2, 0, 1, 3]);
        assert_eq!(result.cyclic, vec![0, 1, 3]);
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        // Two foreign keys from orders to users
        let tables = [("orders", deps(&["users", "users"])), ("users", deps(&[]))];
        assert_eq!(order(&tables).order, vec![1, 0]);
    }
}
