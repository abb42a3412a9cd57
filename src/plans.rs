use anyhow::{Context, Result};
use chrono::{DateTime, Months, Utc};
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::PlanType")]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    #[db_enum(rename = "basic")]
    Basic,
    #[db_enum(rename = "pro")]
    Pro,
    #[db_enum(rename = "premium")]
    Premium,
}

impl PlanType {
    pub const ALL: [PlanType; 3] = [PlanType::Basic, PlanType::Pro, PlanType::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Basic => "basic",
            PlanType::Pro => "pro",
            PlanType::Premium => "premium",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(PlanType::Basic),
            "pro" => Ok(PlanType::Pro),
            "premium" => Ok(PlanType::Premium),
            other => anyhow::bail!("Unknown plan type: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::BillingInterval")]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    #[db_enum(rename = "monthly")]
    Monthly,
    #[db_enum(rename = "yearly")]
    Yearly,
}

impl BillingInterval {
    pub const ALL: [BillingInterval; 2] = [BillingInterval::Monthly, BillingInterval::Yearly];

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            BillingInterval::Monthly => 1,
            BillingInterval::Yearly => 12,
        }
    }

    /// End of a billing period that starts at `start`.
    ///
    /// Calendar arithmetic: Jan 31 + 1 month lands on the last day of February.
    pub fn period_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_months(Months::new(self.months()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingInterval::Monthly),
            "yearly" | "year" | "annual" => Ok(BillingInterval::Yearly),
            other => anyhow::bail!("Unknown billing interval: {}", other),
        }
    }
}

/// A plan tier paired with the interval it is billed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanSelection {
    pub plan_type: PlanType,
    pub billing_interval: BillingInterval,
}

impl PlanSelection {
    pub fn new(plan_type: PlanType, billing_interval: BillingInterval) -> Self {
        Self {
            plan_type,
            billing_interval,
        }
    }

    /// Parse from the loose string pair carried in provider metadata
    pub fn parse(plan_type: &str, billing_interval: &str) -> Result<Self> {
        Ok(Self::new(plan_type.parse()?, billing_interval.parse()?))
    }

    /// Every plan/interval combination
    pub fn all() -> impl Iterator<Item = PlanSelection> {
        PlanType::ALL.into_iter().flat_map(|plan_type| {
            BillingInterval::ALL
                .into_iter()
                .map(move |interval| PlanSelection::new(plan_type, interval))
        })
    }

    /// Suffix used for per-plan environment variables, e.g. `PRO_MONTHLY`
    pub fn env_suffix(&self) -> String {
        format!(
            "{}_{}",
            self.plan_type.as_str().to_ascii_uppercase(),
            self.billing_interval.as_str().to_ascii_uppercase()
        )
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.plan_type, self.billing_interval)
    }
}

/// Look up provider-specific identifiers (Stripe price ids, PayPal plan ids)
/// from `<PREFIX>_<PLAN>_<INTERVAL>` environment variables. Missing entries are skipped.
pub fn plan_ids_from_env(prefix: &str) -> HashMap<PlanSelection, String> {
    PlanSelection::all()
        .filter_map(|selection| {
            let key = format!("{}_{}", prefix, selection.env_suffix());
            std::env::var(&key)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|value| (selection, value.trim().to_string()))
        })
        .collect()
}

/// List prices in cents, used where the provider has no catalogue of its own (crypto charges)
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    prices: HashMap<PlanSelection, i64>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let prices = PlanSelection::all()
            .map(|selection| {
                let monthly = match selection.plan_type {
                    PlanType::Basic => 499,
                    PlanType::Pro => 999,
                    PlanType::Premium => 1999,
                };
                let cents = match selection.billing_interval {
                    BillingInterval::Monthly => monthly,
                    // Two months free on yearly billing
                    BillingInterval::Yearly => monthly * 10,
                };
                (selection, cents)
            })
            .collect();
        Self { prices }
    }
}

impl PlanCatalog {
    /// Default catalogue overridden by `PLAN_PRICE_<PLAN>_<INTERVAL>_CENTS`
    pub fn from_env() -> Result<Self> {
        let mut catalog = Self::default();
        for selection in PlanSelection::all() {
            let key = format!("PLAN_PRICE_{}_CENTS", selection.env_suffix());
            if let Ok(raw) = std::env::var(&key) {
                let cents: i64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be a whole number of cents", key))?;
                if cents <= 0 {
                    anyhow::bail!("{} must be greater than 0", key);
                }
                catalog.prices.insert(selection, cents);
            }
        }
        Ok(catalog)
    }

    pub fn price_cents(&self, selection: PlanSelection) -> i64 {
        self.prices.get(&selection).copied().unwrap_or_default()
    }
}

/// Format cents as a decimal amount string ("12.50") for providers that take strings
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, cents / 100, cents % 100)
}

/// Parse a decimal amount string ("12.5", "12.50", "-0.50", "12") into cents
pub fn parse_cents(amount: &str) -> Result<i64> {
    let amount = amount.trim();
    let (negative, unsigned) = match amount.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, amount),
    };
    let (whole, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() || !is_digits(whole) || !is_digits(frac) {
        anyhow::bail!("Invalid amount: {}", amount);
    }
    if frac.len() > 2 {
        anyhow::bail!("Amount has more than two decimal places: {}", amount);
    }

    let whole: i64 = whole
        .parse()
        .with_context(|| format!("Invalid amount: {}", amount))?;
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>()? * 10,
        _ => frac.parse::<i64>()?,
    };
    let cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac_cents))
        .with_context(|| format!("Amount out of range: {}", amount))?;
    Ok(if negative { -cents } else { cents })
}
