use std::collections::HashSet;

use crate::models::SourceSchema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJoin<'a> {
    pub name: &'a str,
    pub sql: &'a str,
}

/// Expand the directly required joins into a dependency-ordered, de-duplicated
/// list: every join appears after everything it `requires`. Names missing from
/// the source are skipped.
pub fn resolve_joins<'a, I, S>(source: &'a SourceSchema, required: I) -> Vec<ResolvedJoin<'a>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ordered = Vec::new();
    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut in_progress: HashSet<&'a str> = HashSet::new();
    for name in required {
        visit_join(
            source,
            name.as_ref(),
            &mut visited,
            &mut in_progress,
            &mut ordered,
        );
    }
    ordered
}

fn visit_join<'a>(
    source: &'a SourceSchema,
    name: &str,
    visited: &mut HashSet<&'a str>,
    in_progress: &mut HashSet<&'a str>,
    ordered: &mut Vec<ResolvedJoin<'a>>,
) {
    let Some((key, join)) = source.joins.get_key_value(name) else {
        tracing::debug!(source = %source.name, join = name, "ignoring unknown join");
        return;
    };
    let key = key.as_str();
    // Cycles are rejected when the registry is built; the guard keeps a
    // hand-assembled schema from recursing forever.
    if visited.contains(key) || !in_progress.insert(key) {
        return;
    }
    for dep in &join.requires {
        visit_join(source, dep, visited, in_progress, ordered);
    }
    in_progress.remove(key);
    visited.insert(key);
    ordered.push(ResolvedJoin {
        name: key,
        sql: join.sql.as_str(),
    });
}
