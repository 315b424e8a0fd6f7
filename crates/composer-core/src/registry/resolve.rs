//! The single resolution function every strategy dispatches through.

use super::policy::ConflictStrategy;

/// One entry competing for a name.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate<'a> {
    pub(crate) server: &'a str,
    pub(crate) version: Option<&'a str>,
}

/// Which candidates survive, and under which exposed names.
///
/// Returns `(candidate index, exposed name)` pairs, or `None` when the
/// strategy refuses the collision. `candidates` is in registration order.
pub(crate) fn resolve(
    strategy: &ConflictStrategy,
    local: &str,
    candidates: &[Candidate<'_>],
) -> Option<Vec<(usize, String)>> {
    match strategy {
        ConflictStrategy::Prefix => Some(
            candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (i, format!("{}_{}", c.server, local)))
                .collect(),
        ),
        ConflictStrategy::Suffix => Some(
            candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (i, format!("{}_{}", local, c.server)))
                .collect(),
        ),
        ConflictStrategy::Ignore => Some(vec![(0, local.to_string())]),
        ConflictStrategy::Override => {
            Some(vec![(candidates.len().saturating_sub(1), local.to_string())])
        }
        ConflictStrategy::Error => None,
        ConflictStrategy::Custom { template } => Some(
            candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (i, render_template(template, c.server, local, c.version)))
                .collect(),
        ),
    }
}

/// Fill `{server}`, `{local}` and `{version}` (plus the long forms
/// `{server_name}` and `{tool_name}`).
pub(crate) fn render_template(template: &str, server: &str, local: &str, version: Option<&str>) -> String {
    template
        .replace("{server_name}", server)
        .replace("{tool_name}", local)
        .replace("{server}", server)
        .replace("{local}", local)
        .replace("{version}", version.unwrap_or(""))
}

/// `local` plus the version suffix.
pub(crate) fn versioned_name(suffix_format: &str, local: &str, version: &str) -> String {
    format!("{}{}", local, suffix_format.replace("{version}", version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<Candidate<'static>> {
        vec![
            Candidate { server: "a", version: Some("1") },
            Candidate { server: "b", version: None },
        ]
    }

    #[test]
    fn test_prefix_and_suffix_are_distinct() {
        let prefixed = resolve(&ConflictStrategy::Prefix, "search", &candidates()).unwrap();
        assert_eq!(prefixed, vec![(0, "a_search".into()), (1, "b_search".into())]);

        let suffixed = resolve(&ConflictStrategy::Suffix, "search", &candidates()).unwrap();
        assert_eq!(suffixed, vec![(0, "search_a".into()), (1, "search_b".into())]);
    }

    #[test]
    fn test_ignore_keeps_first_override_keeps_last() {
        assert_eq!(
            resolve(&ConflictStrategy::Ignore, "search", &candidates()).unwrap(),
            vec![(0, "search".into())]
        );
        assert_eq!(
            resolve(&ConflictStrategy::Override, "search", &candidates()).unwrap(),
            vec![(1, "search".into())]
        );
    }

    #[test]
    fn test_error_refuses() {
        assert!(resolve(&ConflictStrategy::Error, "search", &candidates()).is_none());
    }

    #[test]
    fn test_custom_template() {
        let strategy = ConflictStrategy::Custom {
            template: "{server}.{local}@{version}".into(),
        };
        let resolved = resolve(&strategy, "search", &candidates()).unwrap();
        assert_eq!(resolved[0].1, "a.search@1");
        assert_eq!(resolved[1].1, "b.search@");
        assert_eq!(render_template("{server_name}/{tool_name}", "a", "t", None), "a/t");
    }

    #[test]
    fn test_versioned_name() {
        assert_eq!(versioned_name("_v{version}", "search", "2"), "search_v2");
    }
}
