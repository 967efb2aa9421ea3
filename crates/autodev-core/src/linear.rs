//! Linear collaborator interface (optional).
//!
//! When a `LINEAR_API_KEY` is configured, created tasks are linked to the
//! matching Linear issue and the review queue endpoint can list issues
//! awaiting human review.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const API_URL: &str = "https://api.linear.app/graphql";

/// An issue awaiting human review.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingReview {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub url: String,
}

/// Operations the engine needs from Linear.
#[async_trait]
pub trait LinearClient: Send + Sync {
    /// Find the Linear issue matching a GitHub issue title, if any.
    /// Returns the Linear issue id for storage on the task.
    async fn link_issue(&self, title: &str) -> Result<Option<String>>;

    /// Issues currently sitting in a review state.
    async fn pending_review(&self) -> Result<Vec<PendingReview>>;
}

pub struct HttpLinear {
    client: reqwest::Client,
    api_key: String,
}

impl HttpLinear {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(API_URL)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("failed to reach Linear")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Linear API error (status {status})");
        }

        #[derive(Deserialize)]
        struct Envelope<T> {
            data: Option<T>,
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .context("Linear returned a malformed body")?;
        envelope.data.context("Linear response had no data")
    }
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(rename = "issueSearch")]
    issue_search: IssueNodes,
}

#[derive(Debug, Deserialize)]
struct IssueNodes {
    nodes: Vec<IssueNode>,
}

#[derive(Debug, Deserialize)]
struct IssueNode {
    id: String,
    identifier: String,
    title: String,
    url: String,
}

#[async_trait]
impl LinearClient for HttpLinear {
    async fn link_issue(&self, title: &str) -> Result<Option<String>> {
        let data: SearchData = self
            .graphql(
                "query($q: String!) { issueSearch(query: $q, first: 1) { \
                     nodes { id identifier title url } } }",
                json!({ "q": title }),
            )
            .await?;
        Ok(data.issue_search.nodes.into_iter().next().map(|n| n.id))
    }

    async fn pending_review(&self) -> Result<Vec<PendingReview>> {
        let data: SearchData = self
            .graphql(
                "query { issueSearch(query: \"state:\\\"In Review\\\"\", first: 50) { \
                     nodes { id identifier title url } } }",
                json!({}),
            )
            .await?;
        Ok(data
            .issue_search
            .nodes
            .into_iter()
            .map(|n| PendingReview {
                id: n.id,
                identifier: n.identifier,
                title: n.title,
                url: n.url,
            })
            .collect())
    }
}
