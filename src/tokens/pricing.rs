//! Price tables: fixed or tiered range pricing, validation and range matching.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound sentinel for an open-ended range.
pub const UNBOUNDED: u64 = u64::MAX;

/// Stored tables use `i32::MAX` as their own "no upper bound" marker.
const LEGACY_UNBOUNDED: u64 = i32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("invalid price table: {0}")]
    Invalid(String),

    #[error("no input tier covers {input_tokens} prompt tokens")]
    NoInputTier { input_tokens: u64 },

    #[error("no output range covers {output_tokens} completion tokens (input tier for {input_tokens})")]
    NoOutputRange { input_tokens: u64, output_tokens: u64 },

    #[error("no price table for model '{0}'")]
    UnknownModel(String),
}

fn invalid(msg: impl Into<String>) -> PricingError {
    PricingError::Invalid(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceMode {
    #[serde(alias = "FIXED")]
    Fixed,
    #[serde(alias = "TIERED")]
    Tiered,
}

/// Unit prices per 1,000 tokens. `input`/`output` are required wherever a
/// range is billed; the rest apply only when configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPrices {
    #[serde(default, deserialize_with = "de_price", skip_serializing_if = "Option::is_none")]
    pub input: Option<Decimal>,
    #[serde(default, deserialize_with = "de_price", skip_serializing_if = "Option::is_none")]
    pub output: Option<Decimal>,
    #[serde(default, deserialize_with = "de_price", skip_serializing_if = "Option::is_none")]
    pub image_input: Option<Decimal>,
    #[serde(default, deserialize_with = "de_price", skip_serializing_if = "Option::is_none")]
    pub image_output: Option<Decimal>,
    #[serde(default, deserialize_with = "de_price", skip_serializing_if = "Option::is_none")]
    pub cached_read: Option<Decimal>,
    #[serde(default, deserialize_with = "de_price", skip_serializing_if = "Option::is_none")]
    pub cached_creation: Option<Decimal>,
}

impl UnitPrices {
    pub fn new(input: Decimal, output: Decimal) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
            ..Self::default()
        }
    }

    fn check_positive(&self, at: &str, required: &[(&str, Option<Decimal>)]) -> Result<(), PricingError> {
        for (name, value) in required {
            match value {
                None => return Err(invalid(format!("{}: missing required price '{}'", at, name))),
                Some(v) if *v <= Decimal::ZERO => {
                    return Err(invalid(format!("{}: price '{}' must be positive, got {}", at, name, v)))
                }
                _ => {}
            }
        }
        let optional = [
            ("imageInput", self.image_input),
            ("imageOutput", self.image_output),
            ("cachedRead", self.cached_read),
            ("cachedCreation", self.cached_creation),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                if v <= Decimal::ZERO {
                    return Err(invalid(format!("{}: price '{}' must be positive, got {}", at, name, v)));
                }
            }
        }
        Ok(())
    }
}

/// A token interval with its unit prices. The first interval of a list is
/// `[minToken, maxToken]`; every later one is `(minToken, maxToken]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangePrice {
    #[serde(default)]
    pub min_token: u64,
    #[serde(default = "unbounded", deserialize_with = "de_bound", serialize_with = "ser_bound")]
    pub max_token: u64,
    #[serde(flatten)]
    pub prices: UnitPrices,
}

fn unbounded() -> u64 {
    UNBOUNDED
}

impl RangePrice {
    pub fn new(min_token: u64, max_token: u64, prices: UnitPrices) -> Self {
        Self {
            min_token,
            max_token,
            prices,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_token == UNBOUNDED
    }

    fn contains(&self, tokens: u64, first: bool) -> bool {
        let above_min = if first {
            tokens >= self.min_token
        } else {
            tokens > self.min_token
        };
        above_min && tokens <= self.max_token
    }

    fn same_interval(&self, other: &RangePrice) -> bool {
        self.min_token == other.min_token && self.max_token == other.max_token
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub input_range_price: RangePrice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_range_prices: Option<Vec<RangePrice>>,
}

/// Consecutive tier entries sharing one input interval.
#[derive(Debug)]
struct TierGroup<'a> {
    input: &'a RangePrice,
    outputs: Vec<&'a RangePrice>,
    with_outputs: usize,
    entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPriceInfo {
    pub mode: PriceMode,
    /// Fixed-mode prices.
    #[serde(flatten)]
    pub fixed: UnitPrices,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<Tier>,
    /// Per-invocation price of server-side tools (web search, code interpreter, ...).
    #[serde(default, deserialize_with = "de_tool_prices", skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_prices: BTreeMap<String, Decimal>,
}

impl CompletionPriceInfo {
    pub fn fixed(prices: UnitPrices) -> Self {
        Self {
            mode: PriceMode::Fixed,
            fixed: prices,
            tiers: Vec::new(),
            tool_prices: BTreeMap::new(),
        }
    }

    pub fn tiered(tiers: Vec<Tier>) -> Self {
        Self {
            mode: PriceMode::Tiered,
            fixed: UnitPrices::default(),
            tiers,
            tool_prices: BTreeMap::new(),
        }
    }

    pub fn with_tool_price(mut self, tool: impl Into<String>, price: Decimal) -> Self {
        self.tool_prices.insert(tool.into(), price);
        self
    }

    /// Parse and validate a JSON price table.
    pub fn from_json_str(s: &str) -> Result<Self, PricingError> {
        let info: CompletionPriceInfo =
            serde_json::from_str(s).map_err(|e| invalid(format!("malformed JSON: {}", e)))?;
        info.validate()?;
        Ok(info)
    }

    fn groups(&self) -> Vec<TierGroup<'_>> {
        let mut groups: Vec<TierGroup<'_>> = Vec::new();
        for tier in &self.tiers {
            let input = &tier.input_range_price;
            let outputs = tier.output_range_prices.as_deref().filter(|o| !o.is_empty());
            match groups.last_mut() {
                Some(g) if g.input.same_interval(input) => {
                    g.entries += 1;
                    if let Some(o) = outputs {
                        g.with_outputs += 1;
                        g.outputs.extend(o.iter());
                    }
                }
                _ => groups.push(TierGroup {
                    input,
                    outputs: outputs.map(|o| o.iter().collect()).unwrap_or_default(),
                    with_outputs: usize::from(outputs.is_some()),
                    entries: 1,
                }),
            }
        }
        groups
    }

    /// Check every invariant, failing on the first violation.
    pub fn validate(&self) -> Result<(), PricingError> {
        for (tool, price) in &self.tool_prices {
            if *price <= Decimal::ZERO {
                return Err(invalid(format!("tool price '{}' must be positive, got {}", tool, price)));
            }
        }
        match self.mode {
            PriceMode::Fixed => self
                .fixed
                .check_positive("fixed", &[("input", self.fixed.input), ("output", self.fixed.output)]),
            PriceMode::Tiered => self.validate_tiers(),
        }
    }

    fn validate_tiers(&self) -> Result<(), PricingError> {
        let groups = self.groups();
        if groups.is_empty() {
            return Err(invalid("tiered mode needs at least one tier"));
        }
        let inputs: Vec<&RangePrice> = groups.iter().map(|g| g.input).collect();
        check_coverage("tiers", &inputs)?;

        for (i, group) in groups.iter().enumerate() {
            let at = format!("tiers[{}]", i);
            let p = &group.input.prices;
            p.check_positive(&at, &[("input", p.input), ("output", p.output)])?;

            if group.with_outputs == 0 {
                continue;
            }
            if group.with_outputs != group.entries {
                return Err(invalid(format!(
                    "{}: output ranges must be given for every entry of the input tier or for none",
                    at
                )));
            }
            check_coverage(&format!("{}.outputRangePrices", at), &group.outputs)?;
            for (j, out) in group.outputs.iter().enumerate() {
                let at = format!("{}.outputRangePrices[{}]", at, j);
                out.prices.check_positive(&at, &[("output", out.prices.output)])?;
            }
        }
        Ok(())
    }

    /// Find the prices that apply to a call with the given token counts.
    pub fn match_range_price(&self, input_tokens: u64, output_tokens: u64) -> Result<RangePrice, PricingError> {
        if self.mode == PriceMode::Fixed {
            return Ok(RangePrice::new(0, UNBOUNDED, self.fixed.clone()));
        }
        let groups = self.groups();
        let group = groups
            .iter()
            .enumerate()
            .find(|(i, g)| g.input.contains(input_tokens, *i == 0))
            .map(|(_, g)| g)
            .ok_or(PricingError::NoInputTier { input_tokens })?;

        if group.outputs.is_empty() {
            return Ok(group.input.clone());
        }
        let out = group
            .outputs
            .iter()
            .enumerate()
            .find(|(i, r)| r.contains(output_tokens, *i == 0))
            .map(|(_, r)| *r)
            .ok_or(PricingError::NoOutputRange {
                input_tokens,
                output_tokens,
            })?;

        let tier = &group.input.prices;
        Ok(RangePrice::new(
            out.min_token,
            out.max_token,
            UnitPrices {
                input: tier.input,
                output: out.prices.output,
                image_input: out.prices.image_input.or(tier.image_input),
                image_output: out.prices.image_output.or(tier.image_output),
                cached_read: out.prices.cached_read.or(tier.cached_read),
                cached_creation: out.prices.cached_creation.or(tier.cached_creation),
            },
        ))
    }
}

/// Ordered, gap-free cover of `[0, +inf)` with strictly increasing bounds.
fn check_coverage(at: &str, ranges: &[&RangePrice]) -> Result<(), PricingError> {
    let Some(first) = ranges.first() else {
        return Err(invalid(format!("{}: empty range list", at)));
    };
    if first.min_token != 0 {
        return Err(invalid(format!("{}[0]: minToken must be 0, got {}", at, first.min_token)));
    }
    let mut prev_max: Option<u64> = None;
    for (i, r) in ranges.iter().enumerate() {
        if r.min_token >= r.max_token {
            return Err(invalid(format!(
                "{}[{}]: minToken {} must be below maxToken {}",
                at, i, r.min_token, r.max_token
            )));
        }
        if let Some(prev) = prev_max {
            if r.min_token != prev {
                return Err(invalid(format!(
                    "{}[{}]: minToken {} must equal previous maxToken {}",
                    at, i, r.min_token, prev
                )));
            }
        }
        prev_max = Some(r.max_token);
    }
    if prev_max != Some(UNBOUNDED) {
        return Err(invalid(format!("{}: last range must be unbounded", at)));
    }
    Ok(())
}

fn de_bound<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    use serde::de::Error as _;
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(UNBOUNDED),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "inf" | "infinity" | "+inf" => Ok(UNBOUNDED),
            other => other
                .parse::<u64>()
                .map(normalize_bound)
                .map_err(|_| D::Error::custom(format!("invalid maxToken '{}'", s))),
        },
        Some(Value::Number(n)) => n
            .as_u64()
            .map(normalize_bound)
            .or_else(|| n.as_f64().filter(|f| f.is_infinite() && *f > 0.0).map(|_| UNBOUNDED))
            .ok_or_else(|| D::Error::custom(format!("invalid maxToken {}", n))),
        Some(other) => Err(D::Error::custom(format!("invalid maxToken {}", other))),
    }
}

fn normalize_bound(n: u64) -> u64 {
    if n == LEGACY_UNBOUNDED {
        UNBOUNDED
    } else {
        n
    }
}

fn ser_bound<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    if *value == UNBOUNDED {
        serializer.serialize_none()
    } else {
        serializer.serialize_u64(*value)
    }
}

/// Prices may be JSON numbers (including exponent form) or decimal strings.
fn de_price<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Decimal>, D::Error> {
    use serde::de::Error as _;
    let raw = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s,
        Some(other) => return Err(D::Error::custom(format!("invalid price {}", other))),
    };
    parse_decimal(&raw)
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("invalid price '{}'", raw)))
}

fn de_tool_prices<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, Decimal>, D::Error> {
    use serde::de::Error as _;
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|(tool, value)| {
            let text = match &value {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                other => return Err(D::Error::custom(format!("invalid price for tool '{}': {}", tool, other))),
            };
            parse_decimal(&text)
                .map(|price| (tool.clone(), price))
                .ok_or_else(|| D::Error::custom(format!("invalid price for tool '{}': {}", tool, text)))
        })
        .collect()
}

pub(crate) fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.contains(['e', 'E']) {
        Decimal::from_scientific(raw).ok()
    } else {
        Decimal::from_str(raw).ok()
    }
}
