//! Ограниченное множество с LRU-вытеснением.
//!
//! `contains` продвигает ключ в MRU; вставка сверх ёмкости выталкивает
//! самый старый. Используется extract-циклом, чтобы в test-режиме не
//! перечитывать блоки с уже проверенным дайджестом.

use std::collections::HashMap;
use std::hash::Hash;

pub struct LruSet<K: Eq + Hash + Clone> {
    capacity: usize,
    // ключ -> порядковый номер последнего касания
    map: HashMap<K, u64>,
    counter: u64,
}

impl<K: Eq + Hash + Clone> LruSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            counter: 0,
        }
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.counter += 1;
        let counter = self.counter;
        match self.map.get_mut(key) {
            Some(stamp) => {
                *stamp = counter;
                true
            }
            None => false,
        }
    }

    pub fn insert(&mut self, key: K) {
        self.counter += 1;
        let counter = self.counter;
        if let Some(stamp) = self.map.get_mut(&key) {
            *stamp = counter;
            return;
        }
        if self.map.len() >= self.capacity {
            // вытолкнуть наименее недавно использованный
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, stamp)| **stamp)
                .map(|(k, _)| k.clone())
            {
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key, counter);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
