//! Client-side cache of filenames reported missing by DIFF
//!
//! Insertion order is preserved and later consumed by PULL in that order.
//! Each client owns its own set; lookups are exact and case-sensitive.

use crate::error::{Result, SyncError};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct MissingSet {
    order: Vec<String>,
    index: HashSet<String>,
    capacity: usize,
}

impl MissingSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: Vec::new(),
            index: HashSet::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds `name` unless already present. A full set rejects the name and
    /// leaves existing entries untouched.
    pub fn insert(&mut self, name: &str) -> Result<InsertOutcome> {
        if self.index.contains(name) {
            return Ok(InsertOutcome::Duplicate);
        }
        if self.order.len() >= self.capacity {
            return Err(SyncError::CacheCapacityExceeded {
                capacity: self.capacity,
                name: name.to_string(),
            });
        }
        self.index.insert(name.to_string());
        self.order.push(name.to_string());
        Ok(InsertOutcome::Added)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }

    /// Drain every entry in insertion order; the set is empty afterwards.
    pub fn take(&mut self) -> Vec<String> {
        self.index.clear();
        std::mem::take(&mut self.order)
    }
}
