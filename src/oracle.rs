//! The external judge consulted for rare clusters, and the ways of reaching one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::cluster::ClusterId;

static RE_MANUAL_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*\(?\s*(yes|no|y|n|1|0)\s*[,\s]\s*([01](?:\.\d*)?|\.\d+)\s*\)?[,\s]*(.*)$").unwrap()
});

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed oracle reply: {0}")]
    Malformed(String),
    #[error("oracle confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("oracle I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("oracle command failed: {0}")]
    Command(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryMetadata {
    pub environment: String,
    pub level: Option<String>,
    pub top_tokens: Vec<String>,
}

/// Everything an oracle is shown about one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct OracleQuery {
    pub cluster_id: ClusterId,
    pub template: String,
    /// At most the configured number of messages, oldest first.
    pub samples: Vec<String>,
    pub metadata: QueryMetadata,
    pub tail_probability: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleVerdict {
    pub anomalous: bool,
    pub confidence: f64,
    pub reason: String,
}

impl OracleVerdict {
    pub fn new(anomalous: bool, confidence: f64, reason: impl Into<String>) -> Result<Self, OracleError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(OracleError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self { anomalous, confidence, reason: reason.into() })
    }
}

pub trait Oracle: Send + Sync {
    /// Identity recorded as the committer of the decisions this oracle makes.
    fn name(&self) -> String;
    fn judge(&self, query: &OracleQuery) -> Result<OracleVerdict, OracleError>;
}

#[derive(Debug, Deserialize)]
struct JsonReply {
    result: serde_json::Value,
    score: serde_json::Value,
    #[serde(default)]
    reason: String,
}

/// Parse `{"result": "yes"|"no", "score": 0.7, "reason": "..."}`.
/// A bool result and a numeric string score are accepted too.
pub fn parse_json_reply(text: &str) -> Result<OracleVerdict, OracleError> {
    let reply: JsonReply = serde_json::from_str(text.trim()).map_err(|e| OracleError::Malformed(e.to_string()))?;
    let anomalous = match &reply.result {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => parse_answer(s).ok_or_else(|| OracleError::Malformed(format!("result `{s}`")))?,
        other => return Err(OracleError::Malformed(format!("result {other}"))),
    };
    let confidence = match &reply.score {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| OracleError::Malformed(format!("score {}", reply.score)))?;
    OracleVerdict::new(anomalous, confidence, reply.reason)
}

/// Parse a typed answer such as `yes 0.8 disk failing` or `(1,0.8)`.
pub fn parse_manual_reply(text: &str) -> Result<OracleVerdict, OracleError> {
    let caps = RE_MANUAL_REPLY
        .captures(text.trim())
        .ok_or_else(|| OracleError::Malformed(text.trim().to_string()))?;
    let anomalous = parse_answer(&caps[1]).ok_or_else(|| OracleError::Malformed(caps[1].to_string()))?;
    let confidence: f64 = caps[2].parse().map_err(|_| OracleError::Malformed(caps[2].to_string()))?;
    OracleVerdict::new(anomalous, confidence, caps[3].trim())
}

fn parse_answer(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "1" | "true" => Some(true),
        "no" | "n" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Asks whoever sits at the terminal. Prompts go to stderr, answers come from stdin.
pub struct ConsoleOracle {
    // one prompt at a time
    lock: Mutex<()>,
    user: String,
}

impl Default for ConsoleOracle {
    fn default() -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
        Self { lock: Mutex::new(()), user }
    }
}

impl Oracle for ConsoleOracle {
    fn name(&self) -> String {
        format!("console:{}", self.user)
    }

    fn judge(&self, query: &OracleQuery) -> Result<OracleVerdict, OracleError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut err = std::io::stderr().lock();
        writeln!(err, "================== review {} ==================", query.cluster_id)?;
        writeln!(err, "Does this log message indicate a system anomaly?")?;
        writeln!(err, "Answer yes or no with a confidence in [0, 1] and a reason, e.g. `yes 0.8 disk errors`.")?;
        writeln!(err, "TEMPLATE: {}", query.template)?;
        writeln!(err, "tail probability: {:.4}", query.tail_probability)?;
        for s in &query.samples {
            writeln!(err, "  {s}")?;
        }
        write!(err, "--> ")?;
        err.flush()?;

        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(OracleError::Malformed("end of input".to_string()));
        }
        parse_manual_reply(&line)
    }
}

/// Runs an external program per query: the query goes to its stdin as JSON, the
/// verdict is read from its stdout as JSON.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
}

impl CommandOracle {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// Split a shell-like command line on whitespace.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl Oracle for CommandOracle {
    fn name(&self) -> String {
        format!("command:{}", self.program)
    }

    fn judge(&self, query: &OracleQuery) -> Result<OracleVerdict, OracleError> {
        let payload = serde_json::to_vec(query).map_err(|e| OracleError::Command(e.to_string()))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(OracleError::Command(format!("{} exited with {}", self.program, output.status)));
        }
        parse_json_reply(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Run `oracle.judge` on a helper thread and give up after `timeout`.
///
/// A call that times out keeps running in the background; its answer is dropped.
pub fn judge_with_timeout(
    oracle: Arc<dyn Oracle>,
    query: OracleQuery,
    timeout: Duration,
) -> Result<OracleVerdict, OracleError> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("oracle-{}", query.cluster_id))
        .spawn(move || {
            let _ = tx.send(oracle.judge(&query));
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(OracleError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(OracleError::Command("oracle thread panicked".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_reply_accepts_tuple_form() {
        let v = parse_manual_reply("(1,0.8)").unwrap();
        assert!(v.anomalous);
        assert_eq!(v.confidence, 0.8);
        assert_eq!(v.reason, "");
    }

    #[test]
    fn manual_reply_keeps_reason() {
        let v = parse_manual_reply("no 0.65 routine heartbeat").unwrap();
        assert!(!v.anomalous);
        assert_eq!(v.reason, "routine heartbeat");
    }
}
