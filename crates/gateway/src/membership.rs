//! Recipient resolution: who takes part in a channel.

use crate::error::{GatewayError, Result};
use crate::protocol::{ChannelId, RecipientId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Resolves the participants of a channel.
#[async_trait]
pub trait MembershipResolver: Send + Sync + 'static {
    /// All participant identities of `channel_id`, the sender included.
    async fn resolve_recipients(&self, channel_id: ChannelId) -> Result<Vec<RecipientId>>;
}

/// Fixed membership table.
///
/// Channels without an explicit entry resolve to `default_members`.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    channels: HashMap<ChannelId, Vec<RecipientId>>,
    default_members: Vec<RecipientId>,
}

impl StaticMembership {
    /// Every channel resolves to `members`.
    pub fn new(default_members: Vec<RecipientId>) -> Self {
        Self {
            channels: HashMap::new(),
            default_members,
        }
    }

    /// Set the members of one channel.
    pub fn with_channel(mut self, channel_id: ChannelId, members: Vec<RecipientId>) -> Self {
        self.channels.insert(channel_id, members);
        self
    }
}

#[async_trait]
impl MembershipResolver for StaticMembership {
    async fn resolve_recipients(&self, channel_id: ChannelId) -> Result<Vec<RecipientId>> {
        Ok(self
            .channels
            .get(&channel_id)
            .unwrap_or(&self.default_members)
            .clone())
    }
}

/// Membership served over HTTP.
///
/// `GET {base_url}/channels/{cid}/members` must return a JSON array of ids.
pub struct HttpMembership {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpMembership {
    /// Create a resolver against `base_url` with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn members_url(&self, channel_id: ChannelId) -> String {
        format!("{}/channels/{}/members", self.base_url, channel_id)
    }
}

#[async_trait]
impl MembershipResolver for HttpMembership {
    async fn resolve_recipients(&self, channel_id: ChannelId) -> Result<Vec<RecipientId>> {
        let url = self.members_url(channel_id);
        debug!("Fetching members from: {}", url);

        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Membership(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        Ok(response.json::<Vec<RecipientId>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_membership() {
        let members = StaticMembership::new(vec![1, 2, 3, 4]).with_channel(42, vec![1, 2, 3]);
        assert_eq!(members.resolve_recipients(42).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(members.resolve_recipients(7).await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_members_url() {
        let members = HttpMembership::new("http://roster:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(members.members_url(42), "http://roster:8080/channels/42/members");
    }
}
