//! Three-stage LLM orchestration.
//!
//! Stage A (primary model) produces the top-3 categories, a reason, an
//! action flag and a sentiment. Stage B (light model) re-checks the
//! action flag and wins on disagreement. Stage C (light model) collapses
//! the top-3 into one final category, context first, static priority
//! table as tie-breaker. A and B are independent and run concurrently.
//!
//! JSON decoding happens once, here, at the component boundary; the rest
//! of the engine consumes typed values. Stage failures are not retried —
//! a message is only ever re-examined through the read-retry path.

use anyhow::Context;
use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_json::json;

use crate::configuration::LlmSettings;
use crate::configuration::ModelCostSettings;
use crate::domain::ActionRequired;
use crate::domain::Classification;
use crate::domain::Sentiment;
use crate::domain::TokenUsage;

/// Keeps the prompt inside the model's context window; the operative part
/// of a thread is concluded well before this.
const MAX_CLASSIFICATION_CHARS: usize = 300_000;

const CATEGORISE_SYSTEM_PROMPT: &str = r#"You are an advanced email classification assistant tasked with analysing email content and performing the list of defined tasks. You must accomplish the following tasks:

1. Classify the email content according to the classification categories below. You must return a list of the top 3 possible categories that the email context aligns to, the most related category first and the least related last. Follow the chronological order of the email conversation and ensure that the latest response is used for classification. Strictly use the following category mapping only:

    amendments: Add, change, or remove individual risk items or the details of a policy. This includes changes to risk/physical address, contact details, policy holder details, household members, commencement date, debit order or banking details, cashback details, premium waivers, and deceased customer information. Also add/change/remove a vehicle, vehicle driver, cover, use, parking or finance details; buildings details, insured values, geysers and general buildings cover queries; home contents and their insured values and security updates; portable possessions (laptops, tablets, jewellery, cellphones, cameras); and split-risk requests where items are insured at more than one residential address.

    vehicle tracking: Emails containing a shared tracking device fitment certificate, vehicle inspection details, tracker device certification, or anything related to vehicle tracking devices.

    bad service/experience: Complaints and negative feedback from customers indicating bad service or experience related to our products or services.

    claims: Capturing an insurance claim against a policy or following up on an existing claim, for loss or damage to any insured risk including vehicles, buildings, home contents, portable possessions and geysers.

    refund request: A request for a refund related to a new or existing policy, or a follow-up on an existing refund request.

    document request: The sender requests a document, such as a policy schedule, claims history, noting of interest, tax letter, cross border document, or statement of services or benefits.

    online/app: System errors or queries about the online website or applications.

    retentions: Policy reinstatements, cancellation or termination of the entire policy (not individual risk items), cancellations related to annual review queries, and refunds after cancellation.

    request for quote: A request for an insurance quotation or to undergo the quotation/underwriting process.

    debit order switch: A request from a bank or banking institution to change the banking details of the policy holder.

    previous insurance checks/queries: Requests or queries related to a previous insurance (PI) check, verification or validation.

    assist: Requests for roadside assistance, towing assistance or home assist (plumber, electrician, locksmith or glazier emergencies).

    If the email cannot be classified into one of the above categories, classify it as "other". Do not use any classifications except those above.

2. Provide a short explanation for the classification in one sentence only.

3. Determine if any action is required based exclusively on the latest email in the chain. The latest email is the first message in the provided content, has the most recent timestamp, and is not indented or preceded by ">" quote markers. If the latest email contains requests, questions or tasks requiring a response, answer "yes", otherwise "no". All emails classified as vehicle tracking have an action required.

4. Classify the sentiment of the email as positive, neutral, or negative. Only classify sentiment when the customer expresses an apparent sentiment towards the products or services offered by the company; otherwise use neutral.

When classifying, always prioritise the content of the latest email, even if it is brief; give the subject line lower priority than the message content. Only reference earlier messages in the thread when the latest email is very brief, explicitly references previous context, or would be ambiguous without it. Do not be misled by a subject line that no longer matches the latest message.

Ensure your output conforms to the following JSON format:
{
"classification": ["category1", "category2", "category3"],
"rsn_classification": "answer",
"action_required": "answer",
"sentiment": "answer"
}"#;

const ACTION_CHECK_SYSTEM_PROMPT: &str = r#"You are an intelligent assistant specialized in analyzing email chains to determine if action is required. Focus exclusively on the latest email in the chain and determine if it requires any action, response, or follow-up.

Instructions:
1. Identify the latest email in the chain: it is typically at the top of the thread, has the most recent timestamp, and is not indented or preceded by ">" quote markers.
2. Look ONLY at the most recent email and check for direct questions that need answers, requests for information or documents, tasks to be performed, issues needing resolution, or anything else requiring a response.
3. Disregard the content of previous emails in the thread.
4. Respond with only "yes" if action is needed, "no" if not.

The output must be in the following JSON format:
{"action_required": "yes"} or {"action_required": "no"}"#;

const PRIORITISE_SYSTEM_PROMPT: &str = r#"You are an intelligent assistant specialized in analyzing the text of an email and a list of up to 3 possible categories that the email falls into.

Instructions:
1. Use the provided email context and the category list to make a final decision on the single most appropriate category. The decision must be based on the context of the email as the primary factor. Only refer to the priority list below if there is ambiguity or uncertainty.
2. Only if there is ambiguity and more than one possible category applies, consider the following category priority list (1 is highest priority):

    Priority | Category
    ---------|---------------------------
    1        | assist
    2        | bad service/experience
    3        | vehicle tracking
    4        | debit order switch
    5        | retentions
    6        | amendments
    7        | claims
    8        | refund request
    9        | online/app
    10       | request for quote
    11       | document request
    12       | other
    13       | previous insurance checks/queries

3. Provide a short explanation of why you chose the final classification based on the EMAIL CONTEXT.

Use the following JSON format for your response:
{
    "final_category": "answer",
    "rsn_classification": "answer"
}"#;

#[derive(thiserror::Error, Debug)]
pub enum ClassifierError {
    #[error("the model returned a malformed response")]
    MalformedResponse(#[source] anyhow::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub struct Classifier {
    http_client: Client,
    endpoint: String,
    api_key: Secret<String>,
    backup: Option<(String, Secret<String>)>,
    api_version: String,
    primary_deployment: String,
    light_deployment: String,
    costs: ModelCostSettings,
}

impl Classifier {
    pub fn new(settings: LlmSettings) -> Self {
        let backup = match (settings.backup_endpoint, settings.backup_api_key) {
            (Some(endpoint), Some(key)) => Some((endpoint, key)),
            _ => None,
        };
        Self {
            // the LLM calls rely on the client's default timeout
            http_client: Client::new(),
            endpoint: settings.endpoint,
            api_key: settings.api_key,
            backup,
            api_version: settings.api_version,
            primary_deployment: settings.primary_deployment,
            light_deployment: settings.light_deployment,
            costs: settings.costs,
        }
    }

    /// Classify one message. Stage A failure fails the whole call; stage B
    /// and C failures degrade to stage A's answer.
    #[tracing::instrument(skip_all)]
    pub async fn classify(
        &self,
        text: &str,
    ) -> Result<Classification, ClassifierError> {
        let text = sanitise(text);

        let (categorise, action_check) =
            tokio::join!(self.categorise(&text), self.action_check(&text));

        let (reply, primary_usage) = categorise?;
        let mut light_usage = TokenUsage::default();
        let mut cost_usd = stage_cost(
            primary_usage,
            self.costs.primary_prompt_per_million,
            self.costs.primary_completion_per_million,
        );

        let mut action_required = reply.action_required;
        match action_check {
            Ok((checked, usage)) => {
                light_usage.add(usage);
                cost_usd += stage_cost(
                    usage,
                    self.costs.light_prompt_per_million,
                    self.costs.light_completion_per_million,
                );
                if checked != action_required {
                    tracing::info!(
                        original = action_required.as_str(),
                        checked = checked.as_str(),
                        "action re-check overrides the categorise stage"
                    );
                    action_required = checked;
                }
            }
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "action re-check failed, keeping stage A's answer");
            }
        }

        let top_categories: Vec<String> = reply
            .classification
            .into_list()
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        let first = top_categories
            .first()
            .cloned()
            .ok_or_else(|| {
                ClassifierError::MalformedResponse(anyhow::anyhow!(
                    "categorise stage returned no categories"
                ))
            })?;

        let (category, reason) = match self.prioritise(&text, &top_categories).await {
            Ok((prioritised, usage)) => {
                light_usage.add(usage);
                cost_usd += stage_cost(
                    usage,
                    self.costs.light_prompt_per_million,
                    self.costs.light_completion_per_million,
                );
                (
                    prioritised.final_category.to_lowercase(),
                    prioritised.rsn_classification,
                )
            }
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "prioritise stage failed, keeping the top category");
                (first, reply.rsn_classification.clone())
            }
        };

        Ok(Classification {
            category,
            top_categories,
            reason,
            action_required,
            sentiment: reply.sentiment,
            cost_usd: round5(cost_usd),
            primary_usage,
            light_usage,
        })
    }

    async fn categorise(
        &self,
        text: &str,
    ) -> Result<(CategoriseReply, TokenUsage), ClassifierError> {
        let user = format!("Please classify the following email:\n\n{text}");
        self.stage(&self.primary_deployment, CATEGORISE_SYSTEM_PROMPT, &user, 0.2)
            .await
    }

    async fn action_check(
        &self,
        text: &str,
    ) -> Result<(ActionRequired, TokenUsage), ClassifierError> {
        let user = format!(
            "Analyze this email chain and determine if the latest email requires action:\n\n{text}"
        );
        let (reply, usage): (ActionCheckReply, TokenUsage) = self
            .stage(&self.light_deployment, ACTION_CHECK_SYSTEM_PROMPT, &user, 0.1)
            .await?;
        Ok((reply.action_required, usage))
    }

    async fn prioritise(
        &self,
        text: &str,
        top_categories: &[String],
    ) -> Result<(PrioritiseReply, TokenUsage), ClassifierError> {
        let user = format!(
            "Analyze this email chain and the list of categories that this email applies to and \
             provide a single category classification based on the email context and the provided \
             priority list:\n\n Email text: {text} \n\n Category List: {top_categories:?}"
        );
        self.stage(&self.light_deployment, PRIORITISE_SYSTEM_PROMPT, &user, 0.1)
            .await
    }

    /// One chat-completion call in JSON mode, decoded into the stage's
    /// reply type. A transport-level failure against the primary endpoint
    /// is retried once against the backup region.
    async fn stage<R>(
        &self,
        deployment: &str,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<(R, TokenUsage), ClassifierError>
    where
        R: serde::de::DeserializeOwned,
    {
        let response = match self
            .complete(&self.endpoint, &self.api_key, deployment, system, user, temperature)
            .await
        {
            Ok(response) => response,
            Err(e) => match &self.backup {
                Some((endpoint, key)) => {
                    tracing::warn!(error.cause_chain = ?e, "primary LLM endpoint failed, trying backup");
                    self.complete(endpoint, key, deployment, system, user, temperature)
                        .await?
                }
                None => return Err(ClassifierError::Unexpected(e)),
            },
        };

        let content = response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| {
                ClassifierError::MalformedResponse(anyhow::anyhow!("response carried no choices"))
            })?;
        let reply = serde_json::from_str::<R>(content).map_err(|e| {
            ClassifierError::MalformedResponse(
                anyhow::Error::new(e).context(format!("undecodable stage reply: {content}")),
            )
        })?;
        let usage = TokenUsage {
            prompt: response.usage.prompt_tokens,
            completion: response.usage.completion_tokens,
            cached: response
                .usage
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0),
        };
        Ok((reply, usage))
    }

    async fn complete(
        &self,
        endpoint: &str,
        api_key: &Secret<String>,
        deployment: &str,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<ChatResponse, anyhow::Error> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            self.api_version
        );
        let body = json!({
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
            "temperature": temperature,
        });
        let response = self
            .http_client
            .post(&url)
            .header("api-key", api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?
            .error_for_status()
            .context("chat completion returned an error status")?
            .json::<ChatResponse>()
            .await
            .context("chat completion response was not valid JSON")?;
        Ok(response)
    }
}

/// CR/LF/quote-escape and truncate the input before it reaches a prompt.
fn sanitise(text: &str) -> String {
    let truncated: String = text.chars().take(MAX_CLASSIFICATION_CHARS).collect();
    truncated
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('"', "\\\"")
}

fn stage_cost(
    usage: TokenUsage,
    prompt_per_million: f64,
    completion_per_million: f64,
) -> f64 {
    usage.prompt as f64 / 1_000_000.0 * prompt_per_million
        + usage.completion as f64 / 1_000_000.0 * completion_per_million
}

fn round5(value: f64) -> f64 { (value * 100_000.0).round() / 100_000.0 }

#[derive(Deserialize, Debug)]
struct CategoriseReply {
    classification: OneOrMany,
    rsn_classification: String,
    action_required: ActionRequired,
    sentiment: Sentiment,
}

#[derive(Deserialize)]
struct ActionCheckReply {
    action_required: ActionRequired,
}

#[derive(Deserialize)]
struct PrioritiseReply {
    final_category: String,
    rsn_classification: String,
}

/// The model is told to answer with a list but occasionally answers with a
/// bare string.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_list(self) -> Vec<String> {
        match self {
            Self::One(single) => vec![single],
            Self::Many(list) => list,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<i64>,
}
