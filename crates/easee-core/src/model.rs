use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Charger {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Raw `/state` payload, keyed by vendor field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusSnapshot {
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Raw `/config` payload, keyed by vendor field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSnapshot {
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: i64,
    #[serde(default)]
    pub circuits: Vec<Circuit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circuit {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub year: i32,
    pub month: u32,
    #[serde(default)]
    pub total_energy_usage: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub currency_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct YearTotal {
    pub year: i32,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub user_name: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub access_token: &'a str,
    pub refresh_token: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds.
    pub expires_in: f64,
}

/// Sums monthly energy per year. Records must be sorted by year; the
/// running sum restarts whenever the year changes.
pub fn year_totals(records: &[SessionRecord]) -> Vec<YearTotal> {
    let mut totals: Vec<YearTotal> = Vec::new();
    for record in records {
        match totals.last_mut() {
            Some(current) if current.year == record.year => {
                current.total += record.total_energy_usage;
            }
            _ => totals.push(YearTotal {
                year: record.year,
                total: record.total_energy_usage,
            }),
        }
    }
    totals
}
