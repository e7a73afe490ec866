//! Backlink analyzer: finds sub-selects that read from a sibling CTE.
//!
//! A CTE body such as
//!
//! ```sql
//! select * from orders where customer_id in (select id from vip where tier = 1)
//! ```
//!
//! cannot be sent to the remote database on its own once `vip` is no longer
//! part of the same statement. The analyzer rewrites the sub-select to read
//! from a positional placeholder (`from backlink_0`) and extracts a
//! *resolvable query* (`select id from self where tier = 1`) that is later
//! evaluated in-process against `vip`'s materialized table. The result is
//! injected back as a literal `backlink_0` CTE before the body is executed.
//!
//! Matching is a bounded, non-nested pattern: `(select … from <ident> … )`
//! up to the first closing parenthesis. Sub-selects nested inside other
//! sub-selects are not recognised.

use std::sync::OnceLock;

use regex_lite::Regex;

/// One dependency of a CTE on a sibling's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlink {
    /// Lower-cased name of the referenced sibling CTE.
    pub target: String,
    /// The sub-select without its parentheses, reading `from self`.
    pub query: String,
}

/// Result of analyzing one CTE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// The body with each backlinked `from <sibling>` replaced by
    /// `from backlink_<k>`.
    pub transformed: String,
    /// Backlinks in discovery order; index `k` matches `backlink_<k>`.
    pub backlinks: Vec<Backlink>,
}

/// Name of the synthetic table injected for the `k`-th backlink.
pub fn placeholder(k: usize) -> String {
    format!("backlink_{k}")
}

fn subselect_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)\(\s*select\s+.*?(\bfrom\s+(\w+)).*?\)")
            .unwrap_or_else(|e| panic!("invalid sub-select pattern: {e}"))
    })
}

/// Analyze a lower-cased CTE body.
///
/// `is_known` reports whether an identifier names a sibling CTE already
/// defined earlier in the step (or a banked table). Sub-selects over any
/// other identifier are left untouched. Repeated references to the same
/// sibling each get their own placeholder.
pub fn analyze(body: &str, is_known: impl Fn(&str) -> bool) -> Analysis {
    let mut transformed = String::with_capacity(body.len());
    let mut backlinks = Vec::new();
    let mut copied_to = 0;

    for caps in subselect_pattern().captures_iter(body) {
        let (Some(whole), Some(from_clause), Some(target)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if !is_known(target.as_str()) {
            continue;
        }

        // Resolvable query: the sub-select reading from `self`, parentheses dropped.
        let local_from = from_clause.start() - whole.start();
        let local_end = from_clause.end() - whole.start();
        let sub = whole.as_str();
        let rewritten = format!("{}from self{}", &sub[..local_from], &sub[local_end..]);
        let query = rewritten[1..rewritten.len() - 1].trim().to_string();

        transformed.push_str(&body[copied_to..from_clause.start()]);
        transformed.push_str("from ");
        transformed.push_str(&placeholder(backlinks.len()));
        copied_to = from_clause.end();

        backlinks.push(Backlink {
            target: target.as_str().to_string(),
            query,
        });
    }
    transformed.push_str(&body[copied_to..]);

    Analysis {
        transformed,
        backlinks,
    }
}
