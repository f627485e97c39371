//! Include/exclude set algebra and cohabitating-resource dedup
//!
//! User-facing filters are two string lists collapsed into one membership
//! predicate: an empty include list (or one containing `*`) includes
//! everything, otherwise only listed items are included; the exclude list
//! is then subtracted, so excludes always win.

use std::collections::{BTreeSet, HashMap};

/// A resolved include/exclude membership predicate
#[derive(Clone, Debug, Default)]
pub struct IncludesExcludes {
    includes: BTreeSet<String>,
    excludes: BTreeSet<String>,
}

impl IncludesExcludes {
    /// Create an empty predicate (includes everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add include entries, returning self for chaining
    pub fn includes<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.includes.extend(items.into_iter().map(Into::into));
        self
    }

    /// Add exclude entries, returning self for chaining
    pub fn excludes<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(items.into_iter().map(Into::into));
        self
    }

    /// Whether the item passes the predicate
    pub fn should_include(&self, item: &str) -> bool {
        if self.excludes.contains(item) || self.excludes.contains("*") {
            return false;
        }
        self.includes.is_empty() || self.includes.contains("*") || self.includes.contains(item)
    }

    /// Display form of the include list for logging
    pub fn includes_string(&self) -> String {
        if self.includes.is_empty() {
            "*".to_string()
        } else {
            self.includes.iter().cloned().collect::<Vec<_>>().join(", ")
        }
    }

    /// Display form of the exclude list for logging
    pub fn excludes_string(&self) -> String {
        if self.excludes.is_empty() {
            "<none>".to_string()
        } else {
            self.excludes.iter().cloned().collect::<Vec<_>>().join(", ")
        }
    }

    /// Build a predicate after canonicalizing each entry with `map_fn`.
    ///
    /// Entries the mapper cannot resolve (returning an empty string) are
    /// dropped; `*` passes through untouched. This is how partial resource
    /// names get qualified to full group-resources before matching.
    pub fn generate<F>(includes: &[String], excludes: &[String], mut map_fn: F) -> Self
    where
        F: FnMut(&str) -> String,
    {
        let map_list = |list: &[String], map_fn: &mut F| -> Vec<String> {
            list.iter()
                .filter_map(|item| {
                    if item == "*" {
                        Some(item.clone())
                    } else {
                        let mapped = map_fn(item);
                        if mapped.is_empty() {
                            None
                        } else {
                            Some(mapped)
                        }
                    }
                })
                .collect()
        };

        let includes = map_list(includes, &mut map_fn);
        let excludes = map_list(excludes, &mut map_fn);
        Self::new().includes(includes).excludes(excludes)
    }
}

/// A resource kind served under more than one API group.
///
/// The archive must contain each object once, so the first group seen
/// during the priority-ordered walk claims the resource and later groups
/// skip it.
#[derive(Clone, Debug)]
pub struct CohabitatingResource {
    /// Plural resource name, e.g. `deployments`
    pub resource: String,
    /// The API groups serving it
    pub groups: BTreeSet<String>,
    /// Set once the first group has been archived
    pub seen: bool,
}

impl CohabitatingResource {
    fn new(resource: &str, group1: &str, group2: &str) -> Self {
        Self {
            resource: resource.to_string(),
            groups: [group1.to_string(), group2.to_string()].into(),
            seen: false,
        }
    }

    /// Whether this entry covers the given group
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// The kinds known to cohabitate across API groups, keyed by resource name
pub fn cohabitating_resources() -> HashMap<String, CohabitatingResource> {
    [
        ("deployments", "extensions", "apps"),
        ("daemonsets", "extensions", "apps"),
        ("replicasets", "extensions", "apps"),
        ("networkpolicies", "extensions", "networking.k8s.io"),
        ("events", "", "events.k8s.io"),
    ]
    .into_iter()
    .map(|(r, g1, g2)| (r.to_string(), CohabitatingResource::new(r, g1, g2)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_includes_everything() {
        let ie = IncludesExcludes::new();
        assert!(ie.should_include("pods"));
        assert!(ie.should_include("anything"));
    }

    #[test]
    fn star_includes_everything() {
        let ie = IncludesExcludes::new().includes(["*"]);
        assert!(ie.should_include("pods"));
    }

    #[test]
    fn explicit_includes_restrict() {
        let ie = IncludesExcludes::new().includes(["pods", "secrets"]);
        assert!(ie.should_include("pods"));
        assert!(!ie.should_include("configmaps"));
    }

    #[test]
    fn excludes_win_over_includes() {
        let ie = IncludesExcludes::new()
            .includes(["pods", "secrets"])
            .excludes(["secrets"]);
        assert!(ie.should_include("pods"));
        assert!(!ie.should_include("secrets"));
    }

    #[test]
    fn excludes_win_over_star() {
        let ie = IncludesExcludes::new().includes(["*"]).excludes(["kube-system"]);
        assert!(ie.should_include("default"));
        assert!(!ie.should_include("kube-system"));
    }

    #[test]
    fn inclusion_algebra_property() {
        // should_include(x) == (I="*" ∨ I=∅ ∨ x∈I) ∧ x∉E, sampled across
        // representative combinations.
        let cases: &[(&[&str], &[&str], &str, bool)] = &[
            (&[], &[], "x", true),
            (&["*"], &[], "x", true),
            (&["x"], &[], "x", true),
            (&["y"], &[], "x", false),
            (&[], &["x"], "x", false),
            (&["*"], &["x"], "x", false),
            (&["x"], &["x"], "x", false),
        ];
        for (inc, exc, item, want) in cases {
            let ie = IncludesExcludes::new()
                .includes(inc.iter().copied())
                .excludes(exc.iter().copied());
            assert_eq!(ie.should_include(item), *want, "I={inc:?} E={exc:?}");
        }
    }

    #[test]
    fn generate_maps_and_drops_unresolvable() {
        let ie = IncludesExcludes::generate(
            &["po".to_string(), "bogus".to_string(), "*".to_string()],
            &["deploy".to_string()],
            |item| match item {
                "po" => "pods".to_string(),
                "deploy" => "deployments.apps".to_string(),
                _ => String::new(),
            },
        );
        assert!(ie.should_include("pods"));
        assert!(!ie.should_include("deployments.apps"));
        // "bogus" was dropped, not kept verbatim
        assert!(ie.includes_string().contains("pods"));
        assert!(!ie.includes_string().contains("bogus"));
    }

    #[test]
    fn cohabitating_table_contents() {
        let m = cohabitating_resources();
        assert!(m["deployments"].has_group("apps"));
        assert!(m["deployments"].has_group("extensions"));
        assert!(m["events"].has_group(""));
        assert!(m["events"].has_group("events.k8s.io"));
        assert!(!m["networkpolicies"].has_group("apps"));
        assert!(m.values().all(|c| !c.seen));
    }
}
