use anyhow::{Context, Result};
use log::{debug, error};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ChatId;

/// Each link admits a single member.
pub const INVITE_MEMBER_LIMIT: u32 = 1;
/// Seconds an issued link stays valid.
pub const INVITE_TTL_SECS: i64 = 60;

#[derive(Serialize)]
struct CreateInviteLink<'a> {
    chat_id: &'a ChatId,
    member_limit: u32,
    expire_date: i64,
}

#[derive(Deserialize, Debug)]
struct ApiResponse {
    #[serde(default)]
    result: Option<InviteResult>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct InviteResult {
    #[serde(default)]
    invite_link: Option<String>,
}

/// Bot API client for issuing chat invite links.
#[derive(Clone)]
pub struct InviteApi {
    client: Client,
    api_url: String,
    bot_token: String,
}

impl InviteApi {
    /// * `api_url` - Bot API root, normally `https://api.telegram.org`.
    pub fn new(client: Client, api_url: &str, bot_token: &str) -> Self {
        InviteApi {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    /// Creates a single-use link for `chat_id` expiring `INVITE_TTL_SECS` after `now`.
    ///
    /// `Ok(None)` means the API answered but gave no usable link; transport
    /// failures are errors.
    pub async fn create_invite_link(&self, chat_id: &ChatId, now: i64) -> Result<Option<String>> {
        let url = format!("{}/bot{}/createChatInviteLink", self.api_url, self.bot_token);
        let body = CreateInviteLink {
            chat_id,
            member_limit: INVITE_MEMBER_LIMIT,
            expire_date: now + INVITE_TTL_SECS,
        };
        debug!("Requesting invite link for chat {:?}", chat_id);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("invite request failed")?;
        let status = resp.status();
        let text = resp.text().await.context("invite response unreadable")?;

        let link = serde_json::from_str::<ApiResponse>(&text)
            .map(|r| r.result.and_then(|res| res.invite_link).filter(|l| !l.is_empty()));
        match link {
            Ok(Some(link)) => Ok(Some(link)),
            Ok(None) => {
                error!("Invite API returned no link ({}): {}", status, describe(&text));
                Ok(None)
            }
            Err(err) => {
                error!("Invite API returned malformed body ({}): {}", status, err);
                Ok(None)
            }
        }
    }
}

fn describe(text: &str) -> String {
    serde_json::from_str::<ApiResponse>(text)
        .ok()
        .and_then(|r| r.description)
        .unwrap_or_else(|| text.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn requests_single_use_link_with_short_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTEST:TOKEN/createChatInviteLink"))
            .and(body_json(json!({
                "chat_id": -1001,
                "member_limit": 1,
                "expire_date": 1_700_000_060,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"invite_link": "https://t.me/+abc", "member_limit": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = InviteApi::new(Client::new(), &format!("{}/", server.uri()), "TEST:TOKEN");
        let link = api
            .create_invite_link(&ChatId::Id(-1001), 1_700_000_000)
            .await
            .unwrap();
        assert_eq!(link.as_deref(), Some("https://t.me/+abc"));
    }

    #[tokio::test]
    async fn api_error_yields_no_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let api = InviteApi::new(Client::new(), &server.uri(), "t");
        let link = api
            .create_invite_link(&ChatId::Username("@gone".into()), 0)
            .await
            .unwrap();
        assert!(link.is_none());
    }

    #[tokio::test]
    async fn non_json_body_yields_no_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let api = InviteApi::new(Client::new(), &server.uri(), "t");
        assert!(api.create_invite_link(&ChatId::Id(1), 0).await.unwrap().is_none());
    }
}
