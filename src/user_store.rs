use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::{Client, RequestBuilder, Url};
use serde::Serialize;
use serde_json::Value;

/// A user's entry in the realtime database.
///
/// Only `totalMinutes` and `joinedChannels` are read, and both leniently: a
/// stray sibling entry or an unexpected type never hides the rest of the record.
#[derive(Debug, Default, Clone)]
pub struct UserRecord {
    pub total_minutes: f64,
    joined_channels: Value,
}

impl UserRecord {
    pub fn from_value(value: Value) -> Self {
        let total_minutes = value
            .get("totalMinutes")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let joined_channels = match value {
            Value::Object(mut fields) => fields.remove("joinedChannels").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        UserRecord {
            total_minutes,
            joined_channels,
        }
    }

    /// A channel counts as joined when its entry has a truthy `joinedAt`.
    ///
    /// The database hands back objects keyed `"0"`, `"1"`, ... as arrays, so
    /// numeric channel ids are also looked up by index.
    pub fn is_member_of(&self, channel_id: &str) -> bool {
        let entry = match &self.joined_channels {
            Value::Object(channels) => channels.get(channel_id),
            Value::Array(channels) => channel_id
                .parse::<usize>()
                .ok()
                .and_then(|index| channels.get(index)),
            _ => None,
        };
        entry
            .and_then(|entry| entry.get("joinedAt"))
            .is_some_and(is_truthy)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// The value written under `users/{userId}/joinedChannels/{channelId}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership<'a> {
    /// Milliseconds since the Unix epoch.
    pub joined_at: i64,
    pub channel_name: &'a str,
}

/// Reads and writes user records over the database's REST interface.
#[derive(Clone)]
pub struct UserStore {
    client: Client,
    base_url: Url,
}

impl UserStore {
    /// Creates a new UserStore.
    ///
    /// * `base_url` - Database root, e.g. `https://my-project.firebaseio.com`.
    pub fn new(client: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid database url: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("database url cannot be a base: {}", base_url));
        }
        Ok(UserStore { client, base_url })
    }

    /// Fetches a user's record. A user the database has never seen comes back
    /// as an empty record.
    pub async fn fetch_user(&self, user_id: &str, token: Option<&str>) -> Result<UserRecord> {
        let url = self.url(&["users"], user_id)?;
        debug!("Fetching user record {}", url);

        let resp = authorize(self.client.get(url), token).send().await?;
        let resp = resp.error_for_status()?;
        let record: Value = resp.json().await?;
        Ok(UserRecord::from_value(record))
    }

    /// Stores the membership entry for `channel_id`, replacing any existing one.
    pub async fn record_membership(
        &self,
        user_id: &str,
        channel_id: &str,
        membership: &Membership<'_>,
        token: Option<&str>,
    ) -> Result<()> {
        let url = self.url(&["users", user_id, "joinedChannels"], channel_id)?;
        debug!("Writing membership {}", url);

        authorize(self.client.put(url), token)
            .json(membership)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Joins path segments under the base url; the last one gets the `.json` suffix.
    fn url(&self, parents: &[&str], leaf: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("database url cannot be a base"))?;
            segments.pop_if_empty();
            segments.extend(parents);
            segments.push(&format!("{}.json", leaf));
        }
        Ok(url)
    }
}

fn authorize(req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn membership_requires_truthy_joined_at() {
        let record = UserRecord::from_value(json!({
            "totalMinutes": 42,
            "joinedChannels": {
                "vip": {"joinedAt": 1_700_000_000_000_i64, "channelName": "VIP"},
                "news": {"channelName": "News"},
                "old": {"joinedAt": null},
                "zero": {"joinedAt": 0},
                "off": {"joinedAt": false},
                "blank": {"joinedAt": ""},
                "legacy": true,
            }
        }));
        assert_eq!(record.total_minutes, 42.0);
        assert!(record.is_member_of("vip"));
        for channel in ["news", "old", "zero", "off", "blank", "legacy", "missing"] {
            assert!(!record.is_member_of(channel), "{channel}");
        }
    }

    #[test]
    fn numeric_channel_ids_are_found_in_array_form() {
        let record = UserRecord::from_value(json!({
            "totalMinutes": 120,
            "joinedChannels": [null, {"joinedAt": 1_700_000_000_000_i64, "channelName": "One"}]
        }));
        assert!(record.is_member_of("1"));
        assert!(!record.is_member_of("0"));
        assert!(!record.is_member_of("2"));
        assert!(!record.is_member_of("vip"));
    }

    #[test]
    fn odd_shapes_degrade_to_defaults() {
        let record = UserRecord::from_value(json!({"totalMinutes": "lots", "joinedChannels": 5}));
        assert_eq!(record.total_minutes, 0.0);
        assert!(!record.is_member_of("vip"));

        let record = UserRecord::from_value(json!([1, 2, 3]));
        assert_eq!(record.total_minutes, 0.0);
        assert!(!record.is_member_of("0"));
    }

    #[test]
    fn ids_are_encoded_as_single_segments() {
        let store = UserStore::new(Client::new(), "https://db.example.com/").unwrap();
        let url = store.url(&["users", "a/b"], "c?d").unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/users/a%2Fb/c%3Fd.json"
        );
    }

    #[tokio::test]
    async fn unknown_user_is_empty_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u1.json"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .expect(1)
            .mount(&server)
            .await;

        let store = UserStore::new(Client::new(), &server.uri()).unwrap();
        let record = store.fetch_user("u1", Some("tok")).await.unwrap();
        assert_eq!(record.total_minutes, 0.0);
        assert!(!record.is_member_of("vip"));
    }

    #[tokio::test]
    async fn fetch_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Permission denied"})))
            .mount(&server)
            .await;

        let store = UserStore::new(Client::new(), &server.uri()).unwrap();
        assert!(store.fetch_user("u1", None).await.is_err());
    }

    #[tokio::test]
    async fn writes_membership_under_channel() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/users/u1/joinedChannels/vip.json"))
            .and(body_json(json!({"joinedAt": 1_700_000_000_000_i64, "channelName": "VIP"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = UserStore::new(Client::new(), &server.uri()).unwrap();
        let membership = Membership {
            joined_at: 1_700_000_000_000,
            channel_name: "VIP",
        };
        store
            .record_membership("u1", "vip", &membership, None)
            .await
            .unwrap();
    }
}
