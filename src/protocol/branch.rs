//! Branch naming: `<namespace>/<item-id>-<slug>`.

use crate::store::ItemId;

const MAX_SLUG: usize = 40;

/// Lowercase ASCII alphanumerics joined by single dashes, at most 40 chars.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG {
            break;
        }
    }
    slug.truncate(MAX_SLUG);
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "work".to_string()
    } else {
        slug.to_string()
    }
}

/// Deterministic branch for an item: same id and title, same branch.
pub fn branch_name(namespace: &str, item: ItemId, title: &str) -> String {
    format!("{}/{item}-{}", namespace.trim_matches('/'), slugify(title))
}

/// Split a branch back into namespace and item id.
pub fn parse_branch(branch: &str) -> Option<(&str, ItemId)> {
    let (namespace, rest) = branch.rsplit_once('/')?;
    let digits = rest.split('-').next()?;
    if namespace.is_empty() || digits.is_empty() {
        return None;
    }
    Some((namespace, digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_punctuation_and_case() {
        assert_eq!(slugify("Add HTTP/2 support!"), "add-http-2-support");
        assert_eq!(slugify("  leading and trailing  "), "leading-and-trailing");
        assert_eq!(slugify("Ünïcödé only"), "n-c-d-only");
    }

    #[test]
    fn slug_falls_back_when_nothing_survives() {
        assert_eq!(slugify("!!!"), "work");
        assert_eq!(slugify(""), "work");
    }

    #[test]
    fn slug_is_bounded() {
        let slug = slugify(&"word ".repeat(30));
        assert!(slug.len() <= 40);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn branch_is_deterministic_and_parseable() {
        let a = branch_name("peerloop", 17, "Parse config files");
        let b = branch_name("peerloop", 17, "Parse config files");
        assert_eq!(a, "peerloop/17-parse-config-files");
        assert_eq!(a, b);
        assert_eq!(parse_branch(&a), Some(("peerloop", 17)));
    }

    #[test]
    fn nested_namespaces_parse() {
        assert_eq!(parse_branch("team/bots/4-fix"), Some(("team/bots", 4)));
        assert_eq!(parse_branch("main"), None);
        assert_eq!(parse_branch("peerloop/fix-4"), None);
    }
}
