use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a record, unique within its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to be sent to a destination, as read from a batch source.
///
/// `body` and `parameters` are opaque: they are forwarded verbatim to the
/// destination adapter and never inspected by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Record id, unique within the batch
    pub id: RecordId,

    /// Tag selecting the destination adapter (e.g. "openai")
    pub destination: String,

    /// Model identifier at the destination, may be empty
    #[serde(default)]
    pub target_model: String,

    /// Payload to forward
    pub body: Value,

    /// Tuning options forwarded alongside the body
    #[serde(default = "empty_object")]
    pub parameters: Value,

    /// Explicit queue override; records sharing a group share one queue and rate limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Any other keys of the entry, carried through to the result log untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys a result entry adds to its request entry. A request entry may not use them.
pub const RESULT_KEYS: [&str; 4] = ["response", "error", "attempts_used", "sent_at"];

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One send of one record to its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub record_id: RecordId,
    /// 1-based
    pub attempt_number: u32,
    pub sent_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

impl Attempt {
    pub fn new(record_id: RecordId, attempt_number: u32) -> Self {
        Self {
            record_id,
            attempt_number,
            sent_at: Utc::now(),
            outcome: AttemptOutcome::Pending,
        }
    }
}

/// Final outcome attached to a record: either the destination's response or an error string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Response(Value),
    Error(String),
}

/// The durable outcome of a record, written exactly once per record id.
///
/// Serializes as the original request entry plus `response` or `error`,
/// `attempts_used` and `sent_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredResult")]
pub struct ResultRecord {
    #[serde(flatten)]
    pub request: RequestRecord,
    #[serde(flatten)]
    pub outcome: ResultOutcome,
    pub attempts_used: u32,
    /// When the attempt that produced this outcome was sent
    pub sent_at: DateTime<Utc>,
}

/// Reading side of [`ResultRecord`]. The outcome is listed first so it claims
/// `response`/`error` before the request's catch-all `extra` map sees them.
#[derive(Deserialize)]
struct StoredResult {
    #[serde(flatten)]
    outcome: ResultOutcome,
    #[serde(flatten)]
    request: RequestRecord,
    attempts_used: u32,
    sent_at: DateTime<Utc>,
}

impl From<StoredResult> for ResultRecord {
    fn from(stored: StoredResult) -> Self {
        Self {
            request: stored.request,
            outcome: stored.outcome,
            attempts_used: stored.attempts_used,
            sent_at: stored.sent_at,
        }
    }
}

impl ResultRecord {
    pub fn id(&self) -> RecordId {
        self.request.id
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ResultOutcome::Response(_))
    }
}

/// Processing state of a batch, advanced only by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    NotStarted,
    InProgress,
    Drained,
}
