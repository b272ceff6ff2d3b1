//! 用量与成本核算模块：分层区间定价、价格表校验与精确的十进制成本计算。
//!
//! # Usage and Cost Accounting
//!
//! Turns canonical [`TokenUsage`](crate::types::TokenUsage) into a billed
//! cost through a fixed or multi-tier, range-based price table.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CompletionPriceInfo`] | Fixed or tiered price table with `validate()` and `match_range_price()` |
//! | [`RangePrice`] / [`Tier`] | Token interval with unit prices; input tier with optional output sub-ranges |
//! | [`CostBreakdown`] | Exact per-category cost (`rust_decimal`) |
//! | [`PriceBook`] | Hot-reloadable model -> table registry, validated on every load |
//! | [`quirks`] | Vendor usage corrections, each applied at one pipeline stage |
//!
//! ## Interval rules
//!
//! The first range of a list is `[0, maxToken]`; every later range is
//! `(minToken, maxToken]`, so a count equal to a boundary matches the lower
//! range. Ranges must cover `[0, +inf)` without gaps; an unbounded `maxToken`
//! is written as `null`, omitted, `"inf"` or exactly `2147483647`; larger
//! numbers are ordinary finite bounds.
//!
//! ## Example
//!
//! ```rust
//! use llm_gateway_core::tokens::{CompletionPriceInfo, ToolInvocations};
//! use llm_gateway_core::types::TokenUsage;
//! use rust_decimal::Decimal;
//!
//! let table = CompletionPriceInfo::from_json_str(
//!     r#"{"mode": "fixed", "input": 1.0, "output": 3.0, "toolPrices": {"web_search": 0.5}}"#,
//! ).unwrap();
//! let tools = ToolInvocations::from([("web_search".to_string(), 1)]);
//! let cost = table.cost(&TokenUsage::new(4601, 1244), &tools).unwrap();
//! assert_eq!(cost.total, Decimal::new(8833, 3));
//! ```

mod book;
mod cost;
mod pricing;
pub mod quirks;

pub use book::PriceBook;
pub use cost::{per_thousand, range_cost, BilledTokens, CostBreakdown, ToolInvocations};
pub use pricing::{CompletionPriceInfo, PriceMode, PricingError, RangePrice, Tier, UnitPrices, UNBOUNDED};
