use crate::content::{ContentSections, Section};
use crate::error::ContentError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Validated records keyed by category. Writes swap in a whole new `Arc`,
/// so readers keep a consistent snapshot. No eviction.
#[derive(Debug, Default)]
pub struct ContentCache {
    entries: RwLock<HashMap<String, Arc<ContentSections>>>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<ContentSections>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store a record. Incomplete records are rejected.
    pub fn put(&self, key: &str, value: ContentSections) -> Result<Arc<ContentSections>, ContentError> {
        value.validate()?;
        let record = Arc::new(value);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::clone(&record));
        log::debug!("cached content for {key}");
        Ok(record)
    }

    /// Swap in a copy of the cached record with one section replaced.
    /// Returns `Ok(None)` when nothing is cached for `key`.
    pub fn replace_section(
        &self,
        key: &str,
        section: Section,
        text: &str,
    ) -> Result<Option<Arc<ContentSections>>, ContentError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = entries.get(key) else {
            return Ok(None);
        };
        let next = current.with_section(section, text);
        next.validate()?;
        let record = Arc::new(next);
        entries.insert(key.to_string(), Arc::clone(&record));
        Ok(Some(record))
    }

    pub fn invalidate(&self, key: &str) -> Option<Arc<ContentSections>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ContentSections {
        ContentSections {
            general: "g".into(),
            symptoms: "s".into(),
            treatment: "t".into(),
            prevention: "p".into(),
        }
    }

    #[test]
    fn put_then_get() {
        let cache = ContentCache::new();
        assert!(cache.get("Brown_Spot").is_none());
        cache.put("Brown_Spot", record()).unwrap();
        assert_eq!(cache.get("Brown_Spot").as_deref(), Some(&record()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejects_incomplete_records() {
        let cache = ContentCache::new();
        let partial = record().with_section(Section::Prevention, "  ");
        assert!(matches!(
            cache.put("Tungro", partial),
            Err(ContentError::IncompleteContent { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn replace_section_is_copy_on_write() {
        let cache = ContentCache::new();
        cache.put("Tungro", record()).unwrap();
        let before = cache.get("Tungro").unwrap();

        let after = cache
            .replace_section("Tungro", Section::Treatment, "new")
            .unwrap()
            .unwrap();
        assert_eq!(before.treatment, "t");
        assert_eq!(after.treatment, "new");
        assert_eq!(after.general, "g");
        assert_eq!(cache.get("Tungro").unwrap().treatment, "new");

        assert!(cache.replace_section("Tungro", Section::Treatment, "").is_err());
        assert_eq!(cache.get("Tungro").unwrap().treatment, "new");
        assert!(cache.replace_section("Other", Section::General, "x").unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = ContentCache::new();
        cache.put("Leaf_Blight", record()).unwrap();
        assert!(cache.invalidate("Leaf_Blight").is_some());
        assert!(!cache.contains("Leaf_Blight"));
        assert!(cache.invalidate("Leaf_Blight").is_none());
    }
}
