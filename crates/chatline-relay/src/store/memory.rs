use anyhow::Result;
use chatline::protocol::{Envelope, Frame, MessageId, UserId};
use dashmap::DashMap;
use std::collections::VecDeque;

use super::{DEFAULT_HISTORY_LIMIT, HistoryKey, HistoryStore, OfflineQueue};

/// Offline queue held in process memory. Lost on restart.
#[derive(Default)]
pub struct MemoryOfflineQueue {
    queues: DashMap<UserId, Vec<Frame>>,
}

impl MemoryOfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OfflineQueue for MemoryOfflineQueue {
    fn push(&self, user_id: UserId, frame: &Frame) -> Result<()> {
        self.queues.entry(user_id).or_default().push(frame.clone());
        Ok(())
    }

    fn take_all(&self, user_id: UserId) -> Result<Vec<Frame>> {
        Ok(self
            .queues
            .remove(&user_id)
            .map(|(_, frames)| frames)
            .unwrap_or_default())
    }

    fn len(&self, user_id: UserId) -> Result<usize> {
        Ok(self.queues.get(&user_id).map(|q| q.len()).unwrap_or(0))
    }
}

pub struct MemoryHistory {
    lists: DashMap<HistoryKey, VecDeque<Envelope>>,
    limit: usize,
}

impl MemoryHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            lists: DashMap::new(),
            limit: limit.max(1),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, key: &HistoryKey, envelope: &Envelope) -> Result<()> {
        let mut list = self.lists.entry(*key).or_default();
        list.push_back(envelope.clone());
        while list.len() > self.limit {
            list.pop_front();
        }
        Ok(())
    }

    fn mark_removed(&self, key: &HistoryKey, id: MessageId) -> Result<bool> {
        let Some(mut list) = self.lists.get_mut(key) else {
            return Ok(false);
        };
        match list.iter_mut().rev().find(|e| e.id == id) {
            Some(entry) => {
                entry.isremove = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn recent(&self, key: &HistoryKey, limit: usize) -> Result<Vec<Envelope>> {
        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let skip = list.len().saturating_sub(limit);
        Ok(list.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline::protocol::{ChatType, MessageKind};
    use serde_json::Map;

    fn envelope(id: MessageId) -> Envelope {
        Envelope {
            id,
            from_id: 1,
            from_name: "alice".to_string(),
            from_avatar: String::new(),
            to_id: 2,
            to_name: "bob".to_string(),
            to_avatar: String::new(),
            chat_type: ChatType::User,
            kind: MessageKind::Text,
            data: format!("m{id}"),
            options: Map::new(),
            create_time: id,
            isremove: false,
        }
    }

    #[test]
    fn take_all_drains_in_order() {
        let queue = MemoryOfflineQueue::new();
        for id in 1..=3 {
            queue.push(2, &Frame::ok(envelope(id))).unwrap();
        }
        assert_eq!(queue.len(2).unwrap(), 3);

        let ids: Vec<_> = queue
            .take_all(2)
            .unwrap()
            .iter()
            .map(|f| f.envelope().unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.take_all(2).unwrap().is_empty());
        assert_eq!(queue.len(2).unwrap(), 0);
    }

    #[test]
    fn history_is_capped() {
        let history = MemoryHistory::new(3);
        let key = HistoryKey::new(2, ChatType::User, 1);
        for id in 1..=5 {
            history.append(&key, &envelope(id)).unwrap();
        }
        let ids: Vec<_> = history
            .recent(&key, 10)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);

        let ids: Vec<_> = history
            .recent(&key, 2)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn mark_removed_flags_entry() {
        let history = MemoryHistory::default();
        let key = HistoryKey::new(2, ChatType::User, 1);
        history.append(&key, &envelope(7)).unwrap();

        assert!(history.mark_removed(&key, 7).unwrap());
        assert!(!history.mark_removed(&key, 8).unwrap());
        assert!(
            !history
                .mark_removed(&HistoryKey::new(3, ChatType::User, 1), 7)
                .unwrap()
        );
        assert!(history.recent(&key, 1).unwrap()[0].isremove);
    }
}
