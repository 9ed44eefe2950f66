//! In-process match store for local runs and tests

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::rest::page_of;
use super::{
    ActiveMatch, ActiveMatchUpdate, MatchSnapshot, MatchStore, MatchmakingTicket, SnapshotCursor,
    SnapshotPage, StoreError,
};
use crate::persist::{SinkError, SnapshotSink};

#[derive(Default)]
pub struct MemoryMatchStore {
    matches: DashMap<String, ActiveMatch>,
    snapshots: DashMap<String, Vec<MatchSnapshot>>,
    user_matches: DashMap<String, String>,
    spectator_channels: DashSet<String>,
    tickets: DashMap<String, MatchmakingTicket>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep history sorted by ply; a second write at the same ply wins.
    pub fn insert_snapshot(&self, snapshot: MatchSnapshot) {
        let mut history = self.snapshots.entry(snapshot.match_id.clone()).or_default();
        match history.binary_search_by_key(&snapshot.ply, |s| s.ply) {
            Ok(i) => history[i] = snapshot,
            Err(i) => history.insert(i, snapshot),
        }
    }

    pub fn has_spectator_channel(&self, match_id: &str) -> bool {
        self.spectator_channels.contains(match_id)
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn get_match(&self, match_id: &str) -> Result<ActiveMatch, StoreError> {
        self.matches
            .get(match_id)
            .map(|m| m.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn put_match(&self, active: &ActiveMatch) -> Result<(), StoreError> {
        match self.matches.entry(active.match_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(active.clone());
                Ok(())
            }
        }
    }

    async fn update_match(&self, match_id: &str, update: &ActiveMatchUpdate) -> Result<(), StoreError> {
        let mut active = self.matches.get_mut(match_id).ok_or(StoreError::NotFound)?;
        if let Some(started_at) = update.started_at {
            active.started_at = Some(started_at);
        }
        if let Some(server) = &update.server {
            active.server = Some(server.clone());
        }
        Ok(())
    }

    async fn delete_match(&self, match_id: &str) -> Result<(), StoreError> {
        self.matches.remove(match_id);
        Ok(())
    }

    async fn fetch_snapshots(
        &self,
        match_id: &str,
        cursor: Option<SnapshotCursor>,
        limit: usize,
        ascending: bool,
    ) -> Result<SnapshotPage, StoreError> {
        let Some(history) = self.snapshots.get(match_id) else {
            return Ok(SnapshotPage::default());
        };
        let after = |s: &&MatchSnapshot| match cursor {
            None => true,
            Some(c) if ascending => s.ply > c.ply,
            Some(c) => s.ply < c.ply,
        };
        let items: Vec<MatchSnapshot> = if ascending {
            history.iter().filter(after).take(limit).cloned().collect()
        } else {
            history.iter().rev().filter(after).take(limit).cloned().collect()
        };
        Ok(page_of(items, limit))
    }

    async fn get_user_match(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.user_matches.get(user_id).map(|m| m.value().clone()))
    }

    async fn put_user_match(&self, user_id: &str, match_id: &str) -> Result<(), StoreError> {
        match self.user_matches.entry(user_id.to_string()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(match_id.to_string());
                Ok(())
            }
        }
    }

    async fn delete_user_match(&self, user_id: &str) -> Result<(), StoreError> {
        self.user_matches.remove(user_id);
        Ok(())
    }

    async fn put_spectator_channel(&self, match_id: &str) -> Result<(), StoreError> {
        self.spectator_channels.insert(match_id.to_string());
        Ok(())
    }

    async fn delete_spectator_channel(&self, match_id: &str) -> Result<(), StoreError> {
        self.spectator_channels.remove(match_id);
        Ok(())
    }

    async fn scan_tickets(&self, game_mode: &str) -> Result<Vec<MatchmakingTicket>, StoreError> {
        let mut tickets: Vec<MatchmakingTicket> = self
            .tickets
            .iter()
            .filter(|t| t.game_mode == game_mode)
            .map(|t| t.value().clone())
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    async fn put_ticket(&self, ticket: &MatchmakingTicket) -> Result<(), StoreError> {
        self.tickets.insert(ticket.user_id.clone(), ticket.clone());
        Ok(())
    }

    async fn delete_ticket(&self, user_id: &str) -> Result<(), StoreError> {
        self.tickets.remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl SnapshotSink for MemoryMatchStore {
    async fn publish(&self, snapshot: &MatchSnapshot) -> Result<(), SinkError> {
        self.insert_snapshot(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn snapshot(match_id: &str, ply: u32) -> MatchSnapshot {
        MatchSnapshot {
            id: Uuid::new_v4(),
            match_id: match_id.into(),
            player_states: BTreeMap::new(),
            game_state: format!("ply {ply}"),
            last_move: None,
            ply,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn user_binding_is_conditional() {
        let store = MemoryMatchStore::new();
        store.put_user_match("u1", "m1").await.unwrap();
        assert!(matches!(
            store.put_user_match("u1", "m2").await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(store.get_user_match("u1").await.unwrap().as_deref(), Some("m1"));

        store.delete_user_match("u1").await.unwrap();
        store.put_user_match("u1", "m2").await.unwrap();
    }

    #[tokio::test]
    async fn snapshots_page_in_both_directions() {
        let store = MemoryMatchStore::new();
        for ply in [3, 1, 2, 4] {
            store.insert_snapshot(snapshot("m", ply));
        }
        store.insert_snapshot(snapshot("other", 9));

        let latest = store.fetch_latest_snapshot("m").await.unwrap().unwrap();
        assert_eq!(latest.ply, 4);

        let page = store.fetch_snapshots("m", None, 2, true).await.unwrap();
        assert_eq!(page.items.iter().map(|s| s.ply).collect::<Vec<_>>(), vec![1, 2]);
        let rest = store.fetch_snapshots("m", page.next, 2, true).await.unwrap();
        assert_eq!(rest.items.iter().map(|s| s.ply).collect::<Vec<_>>(), vec![3, 4]);

        let back = store
            .fetch_snapshots("m", Some(SnapshotCursor { ply: 3 }), 5, false)
            .await
            .unwrap();
        assert_eq!(back.items.iter().map(|s| s.ply).collect::<Vec<_>>(), vec![2, 1]);
        assert!(back.next.is_none());

        assert!(store.fetch_latest_snapshot("none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_match_is_not_found() {
        let store = MemoryMatchStore::new();
        assert!(matches!(store.get_match("x").await, Err(StoreError::NotFound)));
        assert!(matches!(
            store.update_match("x", &ActiveMatchUpdate::default()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn tickets_scan_by_mode_oldest_first() {
        let store = MemoryMatchStore::new();
        let now = Utc::now();
        for (user, mode, age) in [("a", "10+0", 5), ("b", "10+0", 10), ("c", "3+2", 20)] {
            store
                .put_ticket(&MatchmakingTicket {
                    user_id: user.into(),
                    user_rating: 1200.0,
                    user_rd: 100.0,
                    min_rating: 1000.0,
                    max_rating: 1400.0,
                    game_mode: mode.into(),
                    ranked: true,
                    created_at: now - chrono::Duration::seconds(age),
                })
                .await
                .unwrap();
        }
        let found = store.scan_tickets("10+0").await.unwrap();
        assert_eq!(found.iter().map(|t| t.user_id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        store.delete_ticket("b").await.unwrap();
        assert_eq!(store.ticket_count(), 2);
    }
}
