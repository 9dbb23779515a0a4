use crate::activity::ActivityItem;
use std::collections::{HashSet, VecDeque};

/// Default capacity for the notification dedup memory.
pub const DEFAULT_DEDUP_CAPACITY: usize = 200;

/// Result of diffing a fetched list against the stored cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorAdvance {
    /// Genuinely new items in chronological (oldest-first) order.
    pub fresh: Vec<ActivityItem>,
    /// The advanced cursor, if the list produced one.
    pub cursor: Option<String>,
}

/// Diffs a recency-sorted (newest-first) item list against the stored cursor.
///
/// - empty list: nothing new, cursor untouched;
/// - no stored cursor: first observation seeds the cursor from the list head
///   without emitting anything (backlog is indistinguishable from history);
/// - head equals cursor: nothing new;
/// - cursor found mid-list: the prefix before it is new, reversed into
///   chronological order;
/// - cursor not found: the update volume exceeded the fetch window, so the
///   whole list is treated as new (best effort, lossy under large gaps).
///
/// The returned cursor is always the head id when it differs from the stored
/// one, so the cursor only ever moves toward newer items.
pub fn diff_against_cursor(items: &[ActivityItem], cursor: Option<&str>) -> CursorAdvance {
    let Some(head) = items.first() else {
        return CursorAdvance {
            fresh: Vec::new(),
            cursor: cursor.map(str::to_string),
        };
    };
    let head_id = head.unique_id();

    let Some(stored) = cursor else {
        return CursorAdvance {
            fresh: Vec::new(),
            cursor: Some(head_id),
        };
    };

    if head_id == stored {
        return CursorAdvance {
            fresh: Vec::new(),
            cursor: Some(stored.to_string()),
        };
    }

    let mut fresh = Vec::new();
    for item in items {
        if item.unique_id() == stored {
            break;
        }
        fresh.push(item.clone());
    }
    fresh.reverse();

    CursorAdvance {
        fresh,
        cursor: Some(head_id),
    }
}

/// Bounded FIFO set of already-notified item ids. Oldest entries are evicted
/// at capacity so memory stays flat while overlapping feeds cannot
/// re-announce a recently seen item.
#[derive(Debug)]
pub struct DedupMemory {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Records an id; returns true when the id was not already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupMemory {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActionKind, ActorRef};
    use chrono::{TimeZone, Utc};

    fn item(id: u64, minute: u32) -> ActivityItem {
        ActivityItem {
            id: Some(id),
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 10, minute, 0)
                .single()
                .expect("valid timestamp"),
            kind: ActionKind::Reply,
            actor: ActorRef::new("alice"),
            acting: None,
            topic_id: None,
            post_number: None,
            title: None,
            excerpt: None,
            category_id: None,
        }
    }

    fn ids(items: &[ActivityItem]) -> Vec<String> {
        items.iter().map(ActivityItem::unique_id).collect()
    }

    #[test]
    fn head_matching_cursor_yields_nothing() {
        let list = vec![item(5, 5), item(4, 4), item(3, 3)];
        let advance = diff_against_cursor(&list, Some("5"));
        assert!(advance.fresh.is_empty());
        assert_eq!(advance.cursor.as_deref(), Some("5"));
    }

    #[test]
    fn cursor_mid_list_emits_prefix_in_chronological_order() {
        let list = vec![item(5, 5), item(4, 4), item(3, 3)];
        let advance = diff_against_cursor(&list, Some("3"));
        assert_eq!(ids(&advance.fresh), vec!["4", "5"]);
        assert_eq!(advance.cursor.as_deref(), Some("5"));
    }

    #[test]
    fn cursor_missing_from_window_emits_everything() {
        let list = vec![item(6, 6), item(5, 5), item(4, 4)];
        let advance = diff_against_cursor(&list, Some("3"));
        assert_eq!(ids(&advance.fresh), vec!["4", "5", "6"]);
        assert_eq!(advance.cursor.as_deref(), Some("6"));
    }

    #[test]
    fn first_observation_seeds_cursor_silently() {
        let list = vec![item(9, 9), item(8, 8)];
        let advance = diff_against_cursor(&list, None);
        assert!(advance.fresh.is_empty());
        assert_eq!(advance.cursor.as_deref(), Some("9"));
    }

    #[test]
    fn empty_list_leaves_cursor_alone() {
        let advance = diff_against_cursor(&[], Some("3"));
        assert!(advance.fresh.is_empty());
        assert_eq!(advance.cursor.as_deref(), Some("3"));
    }

    #[test]
    fn cursor_never_regresses_across_cycles() {
        let mut cursor = None::<String>;
        let rounds: Vec<Vec<ActivityItem>> = vec![
            vec![item(3, 3)],
            vec![item(5, 5), item(4, 4), item(3, 3)],
            // shrunken window with no new items keeps the cursor
            vec![item(5, 5), item(4, 4)],
            vec![item(7, 7), item(6, 6), item(5, 5)],
        ];
        let mut seen = Vec::new();
        for list in &rounds {
            let advance = diff_against_cursor(list, cursor.as_deref());
            seen.push(advance.cursor.clone());
            cursor = advance.cursor;
        }
        assert_eq!(
            seen,
            vec![
                Some("3".to_string()),
                Some("5".to_string()),
                Some("5".to_string()),
                Some("7".to_string()),
            ]
        );
    }

    #[test]
    fn dedup_emits_each_id_at_most_once() {
        let mut dedup = DedupMemory::new(10);
        assert!(dedup.insert("a"));
        assert!(dedup.insert("b"));
        assert!(!dedup.insert("a"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn dedup_evicts_oldest_at_capacity() {
        let mut dedup = DedupMemory::new(2);
        assert!(dedup.insert("a"));
        assert!(dedup.insert("b"));
        assert!(dedup.insert("c"));
        assert!(!dedup.contains("a"));
        assert!(dedup.contains("b"));
        assert!(dedup.contains("c"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn replaying_identical_list_twice_emits_once() {
        let list = vec![item(5, 5), item(4, 4), item(3, 3)];
        let mut dedup = DedupMemory::default();
        let mut cursor = Some("3".to_string());

        let first = diff_against_cursor(&list, cursor.as_deref());
        cursor = first.cursor;
        let emitted: Vec<_> = first
            .fresh
            .iter()
            .filter(|it| dedup.insert(it.unique_id()))
            .collect();
        assert_eq!(emitted.len(), 2);

        let second = diff_against_cursor(&list, cursor.as_deref());
        let emitted: Vec<_> = second
            .fresh
            .iter()
            .filter(|it| dedup.insert(it.unique_id()))
            .collect();
        assert!(emitted.is_empty());
    }
}
