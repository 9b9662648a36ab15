//! Tagged agent output.

use crate::store::ItemDraft;

use super::{ReviewDecision, WorkOutcome};

/// Text of the last `<name>…</name>` block.
fn last_tag<'a>(output: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = output.rfind(&open)? + open.len();
    let end = output[start..].find(&close)? + start;
    Some(output[start..end].trim())
}

/// Every `<name>…</name>` block, in order.
fn all_tags<'a>(output: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut found = Vec::new();
    let mut rest = output;
    while let Some(pos) = rest.find(&open) {
        let after = &rest[pos + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        found.push(after[..end].trim());
        rest = &after[end + close.len()..];
    }
    found
}

/// `COMPLETE` or `BLOCKED`; a missing signal counts as stuck.
pub fn parse_work_outcome(output: &str) -> WorkOutcome {
    match last_tag(output, "promise") {
        Some("COMPLETE") => WorkOutcome::Completed {
            summary: last_tag(output, "summary").unwrap_or_default().to_string(),
        },
        Some("BLOCKED") => WorkOutcome::Stuck {
            reason: last_tag(output, "reason")
                .filter(|r| !r.is_empty())
                .unwrap_or("agent reported blocked without a reason")
                .to_string(),
        },
        _ => WorkOutcome::Stuck {
            reason: "agent finished without a completion signal".to_string(),
        },
    }
}

pub fn parse_review(output: &str) -> anyhow::Result<ReviewDecision> {
    let comments = last_tag(output, "comments").unwrap_or_default().to_string();
    match last_tag(output, "verdict").map(str::to_ascii_lowercase).as_deref() {
        Some("approve") => Ok(ReviewDecision::Approve { comments }),
        Some("request-changes") => Ok(ReviewDecision::RequestChanges { comments }),
        Some("redundant") => Ok(ReviewDecision::Redundant { comments }),
        Some(other) => anyhow::bail!("unknown review verdict {other:?}"),
        None => anyhow::bail!("agent review produced no verdict"),
    }
}

/// `<item>` blocks with a non-empty title.
pub fn parse_drafts(output: &str) -> Vec<ItemDraft> {
    all_tags(output, "item")
        .into_iter()
        .filter_map(|block| {
            let title = last_tag(block, "title")?.lines().next()?.trim();
            if title.is_empty() {
                return None;
            }
            Some(ItemDraft {
                title: title.to_string(),
                body: last_tag(block, "body").unwrap_or_default().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_with_summary() {
        let out = "did things\n<summary>Adds the parser.</summary>\n<promise>COMPLETE</promise>\n";
        assert_eq!(
            parse_work_outcome(out),
            WorkOutcome::Completed {
                summary: "Adds the parser.".into()
            }
        );
    }

    #[test]
    fn blocked_with_reason() {
        let out = "<reason>fixture file is missing</reason>\n<promise>BLOCKED</promise>";
        assert_eq!(
            parse_work_outcome(out),
            WorkOutcome::Stuck {
                reason: "fixture file is missing".into()
            }
        );
    }

    #[test]
    fn missing_signal_is_stuck() {
        assert!(matches!(parse_work_outcome("no signal here"), WorkOutcome::Stuck { .. }));
    }

    #[test]
    fn last_signal_wins() {
        let out = "<promise>BLOCKED</promise> retrying... <promise>COMPLETE</promise>";
        assert!(matches!(parse_work_outcome(out), WorkOutcome::Completed { .. }));
    }

    #[test]
    fn review_verdicts() {
        assert_eq!(
            parse_review("<verdict>approve</verdict><comments>all criteria met</comments>").unwrap(),
            ReviewDecision::Approve {
                comments: "all criteria met".into()
            }
        );
        assert!(matches!(
            parse_review("<verdict>Request-Changes</verdict>").unwrap(),
            ReviewDecision::RequestChanges { .. }
        ));
        assert!(matches!(
            parse_review("<verdict>redundant</verdict>").unwrap(),
            ReviewDecision::Redundant { .. }
        ));
        assert!(parse_review("<verdict>maybe</verdict>").is_err());
        assert!(parse_review("looks fine").is_err());
    }

    #[test]
    fn drafts_are_collected_in_order() {
        let out = "\
<item><title>Add parser</title><body>- [ ] parses headers</body></item>
noise
<item>
<title>Add CLI</title>
<body>
- [ ] --help works
</body>
</item>
<item><title>  </title><body>ignored</body></item>";
        let drafts = parse_drafts(out);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].title, "Add parser");
        assert_eq!(drafts[1].title, "Add CLI");
        assert_eq!(drafts[1].body, "- [ ] --help works");
    }
}
