//! Command-line query helpers
//!
//! Shared by every `metaq` subcommand: trailing query tokens, optional range
//! bounds and a limit, plus the functions that turn them into a filter or a
//! [`RangeFilter`]. Omitted bounds cover the last seven days.

use crate::error::Result;
use crate::filter::{FilterExpression, FilterGrammar, RangeFilter};
use crate::service::{InstantInput, MetadataQueryBody, RangeInput};
use crate::time::resolve_range;
use crate::types::Timestamp;
use clap::Args;

pub use crate::time::format_time_nanos;

/// Query parameters accepted on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct QueryParams {
    /// Range start (epoch ms, +N/-N ms offset, yyyy-MM-dd/HH:mm[:ss[.SSS]] or HH:mm[:ss[.SSS]])
    #[arg(long)]
    pub start: Option<String>,

    /// Range end, same forms as --start
    #[arg(long)]
    pub end: Option<String>,

    /// Maximum number of results
    #[arg(long)]
    pub limit: Option<i64>,

    /// Filter query tokens, joined with spaces
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub query: Vec<String>,
}

impl QueryParams {
    /// Request body carrying the same query, bounds and limit
    pub fn to_body(&self) -> MetadataQueryBody {
        MetadataQueryBody {
            query: self.query.clone(),
            range: RangeInput {
                start: self.start.clone().map(InstantInput::Literal),
                end: self.end.clone().map(InstantInput::Literal),
            },
            limit: self.limit,
        }
    }
}

/// Parse the query tokens; no tokens matches everything
pub fn setup_filter(grammar: &dyn FilterGrammar, params: &QueryParams) -> Result<FilterExpression> {
    if params.query.is_empty() {
        return Ok(FilterExpression::AlwaysTrue);
    }
    grammar.parse(&params.query)
}

/// Build the full envelope, resolving bounds against `now`
pub fn setup_range_filter(
    grammar: &dyn FilterGrammar,
    params: &QueryParams,
    now: Timestamp,
) -> Result<RangeFilter> {
    let filter = setup_filter(grammar, params)?;
    let range = resolve_range(params.start.as_deref(), params.end.as_deref(), now)?;
    RangeFilter::with_signed_limit(filter, range, params.limit)
}
