//! PostgREST-backed match store using a service key

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    ActiveMatch, ActiveMatchUpdate, MatchSnapshot, MatchStore, MatchmakingTicket, SnapshotCursor,
    SnapshotPage, StoreError,
};
use crate::persist::{SinkError, SnapshotSink};

const ACTIVE_MATCHES: &str = "active_matches";
const SNAPSHOTS: &str = "match_snapshots";
const USER_MATCHES: &str = "user_matches";
const SPECTATOR_CHANNELS: &str = "spectator_channels";
const TICKETS: &str = "matchmaking_tickets";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserMatchRow {
    user_id: String,
    match_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpectatorChannelRow<'a> {
    match_id: &'a str,
}

/// Match store talking to a PostgREST endpoint.
/// The service key bypasses row-level security.
#[derive(Clone)]
pub struct RestMatchStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl RestMatchStore {
    pub fn new(client: Client, base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(StoreError::Conflict);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, table: &str, query: &str) -> Result<Vec<T>, StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);
        let response = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(StoreError::Request)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(StoreError::Parse)
    }

    /// Single-row GET; PostgREST answers 406 when no row matches
    async fn get_one<T: DeserializeOwned>(&self, table: &str, query: &str) -> Result<Option<T>, StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);
        let response = self
            .authed(self.client.get(&url))
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(StoreError::Request)?;

        if response.status() == StatusCode::NOT_ACCEPTABLE {
            return Ok(None);
        }

        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(StoreError::Parse)
    }

    async fn insert<T: Serialize + ?Sized>(&self, table: &str, data: &T) -> Result<(), StoreError> {
        let response = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Prefer", "return=minimal")
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;
        Self::check(response).await.map(|_| ())
    }

    async fn upsert<T: Serialize + ?Sized>(&self, table: &str, data: &T, on_conflict: &str) -> Result<(), StoreError> {
        let url = format!("{}?on_conflict={}", self.rest_url(table), on_conflict);
        let response = self
            .authed(self.client.post(&url))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;
        Self::check(response).await.map(|_| ())
    }

    async fn update<T: Serialize + ?Sized>(&self, table: &str, query: &str, data: &T) -> Result<(), StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);
        let response = self
            .authed(self.client.patch(&url))
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete(&self, table: &str, query: &str) -> Result<(), StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);
        let response = self
            .authed(self.client.delete(&url))
            .send()
            .await
            .map_err(StoreError::Request)?;
        Self::check(response).await.map(|_| ())
    }
}

/// PostgREST filter for a ply-ordered snapshot page
fn snapshot_query(match_id: &str, cursor: Option<SnapshotCursor>, limit: usize, ascending: bool) -> String {
    let (order, op) = if ascending { ("asc", "gt") } else { ("desc", "lt") };
    let mut query = format!("matchId=eq.{match_id}&order=ply.{order}&limit={limit}");
    if let Some(cursor) = cursor {
        query.push_str(&format!("&ply={op}.{}", cursor.ply));
    }
    query
}

/// A full page may have more behind it
pub(crate) fn page_of(items: Vec<MatchSnapshot>, limit: usize) -> SnapshotPage {
    let next = match items.last() {
        Some(last) if items.len() == limit => Some(SnapshotCursor { ply: last.ply }),
        _ => None,
    };
    SnapshotPage { items, next }
}

#[async_trait]
impl MatchStore for RestMatchStore {
    async fn get_match(&self, match_id: &str) -> Result<ActiveMatch, StoreError> {
        self.get_one(ACTIVE_MATCHES, &format!("matchId=eq.{match_id}"))
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn put_match(&self, active: &ActiveMatch) -> Result<(), StoreError> {
        self.insert(ACTIVE_MATCHES, active).await
    }

    async fn update_match(&self, match_id: &str, update: &ActiveMatchUpdate) -> Result<(), StoreError> {
        self.update(ACTIVE_MATCHES, &format!("matchId=eq.{match_id}"), update)
            .await
    }

    async fn delete_match(&self, match_id: &str) -> Result<(), StoreError> {
        self.delete(ACTIVE_MATCHES, &format!("matchId=eq.{match_id}")).await
    }

    async fn fetch_snapshots(
        &self,
        match_id: &str,
        cursor: Option<SnapshotCursor>,
        limit: usize,
        ascending: bool,
    ) -> Result<SnapshotPage, StoreError> {
        let items = self
            .get(SNAPSHOTS, &snapshot_query(match_id, cursor, limit, ascending))
            .await?;
        Ok(page_of(items, limit))
    }

    async fn get_user_match(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let row: Option<UserMatchRow> = self
            .get_one(USER_MATCHES, &format!("userId=eq.{user_id}"))
            .await?;
        Ok(row.map(|r| r.match_id))
    }

    async fn put_user_match(&self, user_id: &str, match_id: &str) -> Result<(), StoreError> {
        // plain insert: the unique key on userId turns a duplicate into 409
        self.insert(
            USER_MATCHES,
            &UserMatchRow {
                user_id: user_id.to_string(),
                match_id: match_id.to_string(),
            },
        )
        .await
    }

    async fn delete_user_match(&self, user_id: &str) -> Result<(), StoreError> {
        self.delete(USER_MATCHES, &format!("userId=eq.{user_id}")).await
    }

    async fn put_spectator_channel(&self, match_id: &str) -> Result<(), StoreError> {
        self.upsert(SPECTATOR_CHANNELS, &SpectatorChannelRow { match_id }, "matchId")
            .await
    }

    async fn delete_spectator_channel(&self, match_id: &str) -> Result<(), StoreError> {
        self.delete(SPECTATOR_CHANNELS, &format!("matchId=eq.{match_id}"))
            .await
    }

    async fn scan_tickets(&self, game_mode: &str) -> Result<Vec<MatchmakingTicket>, StoreError> {
        self.get(TICKETS, &format!("gameMode=eq.{game_mode}&order=createdAt.asc"))
            .await
    }

    async fn put_ticket(&self, ticket: &MatchmakingTicket) -> Result<(), StoreError> {
        self.upsert(TICKETS, ticket, "userId").await
    }

    async fn delete_ticket(&self, user_id: &str) -> Result<(), StoreError> {
        self.delete(TICKETS, &format!("userId=eq.{user_id}")).await
    }
}

#[async_trait]
impl SnapshotSink for RestMatchStore {
    async fn publish(&self, snapshot: &MatchSnapshot) -> Result<(), SinkError> {
        self.upsert(SNAPSHOTS, snapshot, "id")
            .await
            .map_err(SinkError::Store)
    }
}
