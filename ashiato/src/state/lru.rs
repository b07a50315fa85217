use std::{collections::HashMap, hash::Hash};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
struct Link<K> {
    prev: Option<K>,
    next: Option<K>,
    ts: DateTime<Utc>,
}

/// Doubly linked list of keys ordered by last touch. The links live in a
/// map indexed by key so any entry can be moved or removed in O(1)
/// without the owner of the key having to keep a handle on it.
///
/// The head is the least recently touched entry.
#[derive(Debug, Clone)]
pub struct LruList<K> {
    links: HashMap<K, Link<K>>,
    head: Option<K>,
    tail: Option<K>,
}

impl<K> Default for LruList<K> {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K> LruList<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[inline(always)]
    pub fn contains(&self, key: &K) -> bool {
        self.links.contains_key(key)
    }

    /// Returns the time at which `key` was last touched
    #[inline(always)]
    pub fn timestamp(&self, key: &K) -> Option<DateTime<Utc>> {
        self.links.get(key).map(|l| l.ts)
    }

    /// Returns the least recently touched entry
    pub fn front(&self) -> Option<(&K, DateTime<Utc>)> {
        let k = self.head.as_ref()?;
        self.links.get(k).map(|l| (k, l.ts))
    }

    fn unlink(&mut self, key: &K) -> Option<Link<K>> {
        let link = self.links.remove(key)?;

        match &link.prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(p) {
                    l.next = link.next.clone();
                }
            }
            None => self.head = link.next.clone(),
        }

        match &link.next {
            Some(n) => {
                if let Some(l) = self.links.get_mut(n) {
                    l.prev = link.prev.clone();
                }
            }
            None => self.tail = link.prev.clone(),
        }

        Some(link)
    }

    /// Inserts `key` at the back of the list, moving it there if it
    /// is already present.
    pub fn push(&mut self, key: K, ts: DateTime<Utc>) {
        self.unlink(&key);

        let link = Link {
            prev: self.tail.clone(),
            next: None,
            ts,
        };

        match self.tail.as_ref().and_then(|t| self.links.get_mut(t)) {
            Some(tail) => tail.next = Some(key.clone()),
            None => self.head = Some(key.clone()),
        }

        self.tail = Some(key.clone());
        self.links.insert(key, link);
    }

    /// Removes `key` from the list, returns true if it was present
    #[inline]
    pub fn remove(&mut self, key: &K) -> bool {
        self.unlink(key).is_some()
    }

    /// Pops the head of the list if it was touched strictly before `deadline`
    pub fn pop_older(&mut self, deadline: DateTime<Utc>) -> Option<(K, DateTime<Utc>)> {
        let (key, ts) = self.front().map(|(k, ts)| (k.clone(), ts))?;
        if ts >= deadline {
            return None;
        }
        self.unlink(&key);
        Some((key, ts))
    }

    /// Iterates over keys from the least to the most recently touched
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            cur: self.head.as_ref(),
        }
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
    }
}

pub struct Iter<'a, K> {
    list: &'a LruList<K>,
    cur: Option<&'a K>,
}

impl<'a, K> Iterator for Iter<'a, K>
where
    K: Hash + Eq,
{
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.cur?;
        self.cur = self.list.links.get(k).and_then(|l| l.next.as_ref());
        Some(k)
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;

    fn keys(l: &LruList<u32>) -> Vec<u32> {
        l.iter().copied().collect()
    }

    #[test]
    fn test_push_and_touch() {
        let t0 = Utc::now();
        let mut l = LruList::new();

        l.push(1, t0);
        l.push(2, t0 + Duration::seconds(1));
        l.push(3, t0 + Duration::seconds(2));
        assert_eq!(keys(&l), vec![1, 2, 3]);

        // touching moves to the back
        l.push(1, t0 + Duration::seconds(3));
        assert_eq!(keys(&l), vec![2, 3, 1]);
        assert_eq!(l.timestamp(&1), Some(t0 + Duration::seconds(3)));
        assert_eq!(l.len(), 3);
    }

    #[test]
    fn test_remove() {
        let t0 = Utc::now();
        let mut l = LruList::new();
        for i in 0..5 {
            l.push(i, t0);
        }

        assert!(l.remove(&0));
        assert!(l.remove(&2));
        assert!(l.remove(&4));
        assert!(!l.remove(&4));
        assert_eq!(keys(&l), vec![1, 3]);

        l.push(5, t0);
        assert_eq!(keys(&l), vec![1, 3, 5]);

        l.clear();
        assert!(l.is_empty());
        assert!(l.front().is_none());
    }

    #[test]
    fn test_pop_older() {
        let t0 = Utc::now();
        let mut l = LruList::new();
        l.push(1, t0);
        l.push(2, t0 + Duration::seconds(10));
        l.push(3, t0 + Duration::seconds(20));

        let deadline = t0 + Duration::seconds(10);
        assert_eq!(l.pop_older(deadline), Some((1, t0)));
        // strictly older only
        assert_eq!(l.pop_older(deadline), None);
        assert_eq!(keys(&l), vec![2, 3]);

        let deadline = t0 + Duration::seconds(30);
        assert_eq!(l.pop_older(deadline).map(|(k, _)| k), Some(2));
        assert_eq!(l.pop_older(deadline).map(|(k, _)| k), Some(3));
        assert_eq!(l.pop_older(deadline), None);
        assert!(l.is_empty());
    }
}
