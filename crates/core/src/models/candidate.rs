//! Candidate buy suggestions produced by the external analysis stage

use serde::{Deserialize, Serialize};

/// Final verdict attached to a candidate by the scoring stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Buy,
    StrongBuy,
    Watch,
    Avoid,
}

impl Verdict {
    /// Only buy-grade verdicts are ever traded
    pub fn is_actionable(&self) -> bool {
        matches!(self, Verdict::Buy | Verdict::StrongBuy)
    }

    /// Lenient parse for CSV cells ("buy", "STRONG_BUY", "strong buy", ...)
    pub fn parse_lenient(raw: &str) -> Option<Verdict> {
        match raw.trim().to_lowercase().replace(' ', "_").as_str() {
            "buy" => Some(Verdict::Buy),
            "strong_buy" => Some(Verdict::StrongBuy),
            "watch" => Some(Verdict::Watch),
            "avoid" => Some(Verdict::Avoid),
            _ => None,
        }
    }
}

/// A pre-scored buy suggestion for one ticker, consumed once per trading day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub ticker: String,
    pub last_close: f64,
    pub final_verdict: Verdict,
    pub combined_score: f64,
    /// Capital the scorer recommends deploying; engine default applies when absent
    #[serde(default)]
    pub execution_capital: Option<f64>,
}

impl Candidate {
    /// Whether this candidate clears the entry gate
    pub fn accepted(&self, min_combined_score: f64) -> bool {
        self.final_verdict.is_actionable() && self.combined_score >= min_combined_score
    }
}
