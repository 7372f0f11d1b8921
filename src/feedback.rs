use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Unknown,
    Normal,
    Anomaly,
}

impl Decision {
    /// Numeric code: -1 unknown, 0 normal, 1 anomaly.
    pub fn code(self) -> i8 {
        match self {
            Decision::Unknown => -1,
            Decision::Normal => 0,
            Decision::Anomaly => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Decision::Unknown),
            0 => Some(Decision::Normal),
            1 => Some(Decision::Anomaly),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Decision::Unknown => "unknown",
            Decision::Normal => "normal",
            Decision::Anomaly => "anomaly",
        }
    }

    pub fn is_known(self) -> bool {
        self != Decision::Unknown
    }
}

/// Review outcome for one cluster. `p` is derived from `(decision, ep, tp)` on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedBack {
    pub decision: Decision,
    /// Oracle confidence.
    pub ep: f64,
    /// Rarity score at the time of the query.
    pub tp: f64,
    pub reason: String,
    pub committer: String,
}

impl Default for FeedBack {
    fn default() -> Self {
        Self::unknown()
    }
}

impl FeedBack {
    pub fn unknown() -> Self {
        Self { decision: Decision::Unknown, ep: 0.0, tp: 0.0, reason: String::new(), committer: String::new() }
    }

    /// Confidence and rarity are clamped into [0, 1].
    pub fn new(decision: Decision, ep: f64, tp: f64, reason: impl Into<String>, committer: impl Into<String>) -> Self {
        Self {
            decision,
            ep: clamp_unit(ep),
            tp: clamp_unit(tp),
            reason: reason.into(),
            committer: committer.into(),
        }
    }

    pub fn p(&self) -> Option<f64> {
        integrate(self.decision, self.ep, self.tp)
    }
}

/// Integrated anomaly probability. `None` while the decision is unknown.
///
/// anomaly: `ep + (1 - ep) * tp`; normal: `1 - (ep + (1 - ep) * (1 - tp))`.
pub fn integrate(decision: Decision, ep: f64, tp: f64) -> Option<f64> {
    let ep = clamp_unit(ep);
    let tp = clamp_unit(tp);
    let p = match decision {
        Decision::Unknown => return None,
        Decision::Anomaly => ep + (1.0 - ep) * tp,
        Decision::Normal => 1.0 - (ep + (1.0 - ep) * (1.0 - tp)),
    };
    // rounding can leave the normal branch a hair below zero
    Some(clamp_unit(p))
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
