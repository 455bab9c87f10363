use serde::Deserialize;
use serde::Serialize;

/// The fixed business taxonomy. The model is prompted to answer with these
/// labels only; anything else is treated as unroutable and falls back to
/// the original recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Amendments,
    Assist,
    VehicleTracking,
    BadService,
    Claims,
    RefundRequest,
    DocumentRequest,
    OnlineApp,
    Retentions,
    RequestForQuote,
    DebitOrderSwitch,
    PreviousInsurance,
    Other,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Amendments,
        Category::Assist,
        Category::VehicleTracking,
        Category::BadService,
        Category::Claims,
        Category::RefundRequest,
        Category::DocumentRequest,
        Category::OnlineApp,
        Category::Retentions,
        Category::RequestForQuote,
        Category::DebitOrderSwitch,
        Category::PreviousInsurance,
        Category::Other,
    ];

    /// The label as it appears in prompts, model output and audit rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amendments => "amendments",
            Self::Assist => "assist",
            Self::VehicleTracking => "vehicle tracking",
            Self::BadService => "bad service/experience",
            Self::Claims => "claims",
            Self::RefundRequest => "refund request",
            Self::DocumentRequest => "document request",
            Self::OnlineApp => "online/app",
            Self::Retentions => "retentions",
            Self::RequestForQuote => "request for quote",
            Self::DebitOrderSwitch => "debit order switch",
            Self::PreviousInsurance => "previous insurance checks/queries",
            Self::Other => "other",
        }
    }

    /// Case-insensitive label lookup; `None` for anything outside the
    /// taxonomy.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == label)
    }
}

impl std::fmt::Display for Category {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionRequired {
    #[serde(alias = "Yes", alias = "YES")]
    Yes,
    #[serde(alias = "No", alias = "NO")]
    No,
}

impl ActionRequired {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    #[serde(alias = "Positive")]
    Positive,
    #[serde(alias = "Neutral")]
    Neutral,
    #[serde(alias = "Negative")]
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

/// Token counters for one model tier, aggregated across all calls made for
/// one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: i64,
    pub completion: i64,
    pub cached: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 { self.prompt + self.completion }

    pub fn add(
        &mut self,
        other: TokenUsage,
    ) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.cached += other.cached;
    }
}

/// Final output of the classifier for one message.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Final category label, lowercased. Kept as the raw model answer so
    /// an out-of-taxonomy reply is auditable; routing parses it.
    pub category: String,
    /// The categorise stage's ordered top-3, preserved before
    /// prioritisation collapses it.
    pub top_categories: Vec<String>,
    pub reason: String,
    pub action_required: ActionRequired,
    pub sentiment: Sentiment,
    /// Summed USD across every model call made for this message.
    pub cost_usd: f64,
    pub primary_usage: TokenUsage,
    pub light_usage: TokenUsage,
}

impl Classification {
    pub fn top_categories_joined(&self) -> String { self.top_categories.join(", ") }
}
