//! Exact decimal cost calculation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::pricing::{CompletionPriceInfo, PricingError, RangePrice};
use crate::types::TokenUsage;

/// Server-side tool invocations billed per call (tool name -> count).
pub type ToolInvocations = HashMap<String, u64>;

/// Cost per category, in the currency of the price table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input: Decimal,
    pub output: Decimal,
    pub cached_read: Decimal,
    pub cached_creation: Decimal,
    pub image_input: Decimal,
    pub image_output: Decimal,
    pub tools: Decimal,
    pub total: Decimal,
}

/// Token counts per billing category after sub-counts with their own price
/// have been split off the plain input/output counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BilledTokens {
    pub input: u64,
    pub output: u64,
    pub cached_read: u64,
    pub cached_creation: u64,
    pub image_input: u64,
    pub image_output: u64,
}

impl BilledTokens {
    pub fn split(usage: &TokenUsage, price: &RangePrice) -> Self {
        let p = &price.prices;
        let mut billed = BilledTokens {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
            ..Self::default()
        };
        if p.cached_read.is_some() {
            billed.cached_read = usage.cached_read_tokens().min(billed.input);
            billed.input -= billed.cached_read;
        }
        if p.cached_creation.is_some() {
            billed.cached_creation = usage.cache_creation_tokens().min(billed.input);
            billed.input -= billed.cached_creation;
        }
        if p.image_input.is_some() {
            billed.image_input = usage.image_input_tokens().min(billed.input);
            billed.input -= billed.image_input;
        }
        if p.image_output.is_some() {
            billed.image_output = usage.image_output_tokens().min(billed.output);
            billed.output -= billed.image_output;
        }
        billed
    }
}

/// `tokens / 1000 * unit_price`, exact.
pub fn per_thousand(tokens: u64, unit_price: Decimal) -> Decimal {
    if tokens == 0 {
        return Decimal::ZERO;
    }
    Decimal::from(tokens) * unit_price / Decimal::ONE_THOUSAND
}

/// Cost of one call against an already matched range price.
pub fn range_cost(billed: &BilledTokens, price: &RangePrice) -> CostBreakdown {
    let p = &price.prices;
    let at = |tokens: u64, unit: Option<Decimal>| unit.map(|u| per_thousand(tokens, u)).unwrap_or(Decimal::ZERO);
    let mut cost = CostBreakdown {
        input: at(billed.input, p.input),
        output: at(billed.output, p.output),
        cached_read: at(billed.cached_read, p.cached_read),
        cached_creation: at(billed.cached_creation, p.cached_creation),
        image_input: at(billed.image_input, p.image_input),
        image_output: at(billed.image_output, p.image_output),
        ..CostBreakdown::default()
    };
    cost.total = cost.input
        + cost.output
        + cost.cached_read
        + cost.cached_creation
        + cost.image_input
        + cost.image_output;
    cost
}

impl CompletionPriceInfo {
    /// Billed cost of one call: matched range price plus per-invocation tool prices.
    pub fn cost(&self, usage: &TokenUsage, tools: &ToolInvocations) -> Result<CostBreakdown, PricingError> {
        let price = self.match_range_price(usage.prompt_tokens, usage.completion_tokens)?;
        let billed = BilledTokens::split(usage, &price);
        let mut cost = range_cost(&billed, &price);
        for (tool, count) in tools {
            match self.tool_prices.get(tool) {
                Some(unit) => cost.tools += Decimal::from(*count) * *unit,
                None => tracing::debug!(tool = %tool, "no price configured for tool, not billed"),
            }
        }
        cost.total += cost.tools;
        Ok(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::pricing::UnitPrices;
    use crate::types::TokensDetail;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn sub_counts_use_their_own_price_when_configured() {
        let info = CompletionPriceInfo::fixed(UnitPrices {
            cached_read: Some(dec("0.1")),
            ..UnitPrices::new(dec("1"), dec("2"))
        });
        let mut usage = TokenUsage::new(3000, 1000);
        usage.prompt_tokens_details = Some(TokensDetail {
            cached_tokens: Some(2000),
            image_tokens: Some(500),
            ..TokensDetail::default()
        });
        let cost = info.cost(&usage, &ToolInvocations::new()).unwrap();
        assert_eq!(cost.input, dec("1"));
        assert_eq!(cost.cached_read, dec("0.2"));
        assert_eq!(cost.image_input, Decimal::ZERO);
        assert_eq!(cost.output, dec("2"));
        assert_eq!(cost.total, dec("3.2"));
    }

    #[test]
    fn unknown_tools_are_free() {
        let info = CompletionPriceInfo::fixed(UnitPrices::new(dec("1"), dec("1")))
            .with_tool_price("web_search", dec("0.5"));
        let tools = ToolInvocations::from([("web_search".to_string(), 2), ("unknown".to_string(), 9)]);
        let cost = info.cost(&TokenUsage::new(0, 0), &tools).unwrap();
        assert_eq!(cost.tools, dec("1.0"));
        assert_eq!(cost.total, dec("1.0"));
    }

    #[test]
    fn billion_tokens_at_the_smallest_unit_price_is_exact() {
        let info = CompletionPriceInfo::fixed(UnitPrices::new(dec("0.00000001"), dec("0.00000003")));
        let cost = info
            .cost(&TokenUsage::new(1_000_000_000, 1_000_000_000), &ToolInvocations::new())
            .unwrap();
        assert_eq!(cost.input, dec("0.01"));
        assert_eq!(cost.output, dec("0.03"));
        assert_eq!(cost.total, dec("0.04"));
    }

    #[test]
    fn billion_token_tier_edge() {
        use crate::tokens::pricing::{RangePrice, Tier, UNBOUNDED};
        let tier = |min, max, input: &str, output: &str| Tier {
            input_range_price: RangePrice::new(min, max, UnitPrices::new(dec(input), dec(output))),
            output_range_prices: None,
        };
        let info = CompletionPriceInfo::tiered(vec![
            tier(0, 1_000_000_000, "0.00000002", "0.00000004"),
            tier(1_000_000_000, UNBOUNDED, "0.00000001", "0.00000002"),
        ]);
        info.validate().unwrap();
        let none = ToolInvocations::new();

        let at = info.cost(&TokenUsage::new(1_000_000_000, 1_000_000_000), &none).unwrap();
        assert_eq!(at.input, dec("0.02"));
        assert_eq!(at.output, dec("0.04"));
        assert_eq!(at.total, dec("0.06"));

        let above = info.cost(&TokenUsage::new(1_000_000_001, 1_000_000_000), &none).unwrap();
        assert_eq!(above.input, dec("0.01000000001"));
        assert_eq!(above.output, dec("0.02"));
        assert_eq!(above.total, dec("0.03000000001"));
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        let info = CompletionPriceInfo::fixed(UnitPrices {
            cached_read: Some(dec("0.00000001")),
            image_input: Some(dec("0.5")),
            ..UnitPrices::new(dec("0.00000001"), dec("0.00000001"))
        });
        let cost = info.cost(&TokenUsage::new(0, 0), &ToolInvocations::new()).unwrap();
        assert_eq!(cost, CostBreakdown::default());
        assert!(cost.total.is_zero());
    }

    #[test]
    fn no_match_is_an_error_not_zero() {
        let info = CompletionPriceInfo::tiered(vec![]);
        let err = info.cost(&TokenUsage::new(10, 10), &ToolInvocations::new()).unwrap_err();
        assert_eq!(err, PricingError::NoInputTier { input_tokens: 10 });
    }
}
