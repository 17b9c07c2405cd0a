//! Object id -> space id mapping, stored through short per-space aliases.

use log::debug;

use super::common::{CommonStore, OBJECT_SPACE, SPACE_ALIAS_BY_ID, SPACE_ID_BY_ALIAS};
use crate::error::{EngineError, Result};
use crate::kv_store::WriteTxn;

impl CommonStore {
    /// Records that `object_id` lives in `space_id`. Rebinding to another space
    /// fails with `SpaceMismatch`.
    pub fn bind_id(&self, object_id: &str, space_id: &str) -> Result<()> {
        if let Some(existing) = self.space_cache.read().get(object_id) {
            return check_same(object_id, existing, space_id);
        }
        if let Some(existing) = self.lookup(object_id)? {
            check_same(object_id, &existing, space_id)?;
            self.space_cache.write().insert(object_id.to_string(), existing);
            return Ok(());
        }

        let _guard = self.alias_lock.lock();
        self.kv.write(|w| {
            if let Some(alias) = w.get(OBJECT_SPACE, object_id.as_bytes())? {
                let existing = alias_to_space(w, &alias)?;
                return check_same(object_id, &existing, space_id);
            }
            let alias = ensure_alias(w, space_id)?;
            w.put(OBJECT_SPACE, object_id.as_bytes(), alias.as_bytes())
        })?;
        self.space_cache
            .write()
            .insert(object_id.to_string(), space_id.to_string());
        Ok(())
    }

    /// Space of `object_id`, or `NotFound`.
    pub fn resolve_space_id(&self, object_id: &str) -> Result<String> {
        if let Some(space) = self.space_cache.read().get(object_id) {
            return Ok(space.clone());
        }
        let space = self
            .lookup(object_id)?
            .ok_or_else(|| EngineError::not_found(format!("space of object {object_id}")))?;
        self.space_cache
            .write()
            .insert(object_id.to_string(), space.clone());
        Ok(space)
    }

    /// Every space that has at least one bound object.
    pub fn known_space_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .kv
            .scan_prefix(SPACE_ALIAS_BY_ID, b"")?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    fn lookup(&self, object_id: &str) -> Result<Option<String>> {
        self.kv.read(|r| {
            let Some(alias) = r.get(OBJECT_SPACE, object_id.as_bytes())? else {
                return Ok(None);
            };
            let space = r
                .get(SPACE_ID_BY_ALIAS, &alias)?
                .ok_or_else(|| EngineError::Internal(format!("dangling space alias for {object_id}")))?;
            Ok(Some(String::from_utf8_lossy(&space).into_owned()))
        })
    }
}

fn check_same(object_id: &str, existing: &str, requested: &str) -> Result<()> {
    if existing == requested {
        Ok(())
    } else {
        Err(EngineError::SpaceMismatch {
            id: object_id.to_string(),
            existing: existing.to_string(),
            requested: requested.to_string(),
        })
    }
}

fn alias_to_space(w: &WriteTxn<'_>, alias: &[u8]) -> Result<String> {
    w.get(SPACE_ID_BY_ALIAS, alias)?
        .map(|s| String::from_utf8_lossy(&s).into_owned())
        .ok_or_else(|| EngineError::Internal("dangling space alias".into()))
}

/// Returns the alias of `space_id`, allocating max+1 on first use.
fn ensure_alias(w: &mut WriteTxn<'_>, space_id: &str) -> Result<String> {
    if let Some(alias) = w.get(SPACE_ALIAS_BY_ID, space_id.as_bytes())? {
        return Ok(String::from_utf8_lossy(&alias).into_owned());
    }
    let next = w
        .scan_prefix(SPACE_ID_BY_ALIAS, b"")?
        .iter()
        .filter_map(|(k, _)| std::str::from_utf8(k).ok()?.parse::<u64>().ok())
        .max()
        .map_or(1, |max| max + 1);
    let alias = next.to_string();
    w.put(SPACE_ALIAS_BY_ID, space_id.as_bytes(), alias.as_bytes())?;
    w.put(SPACE_ID_BY_ALIAS, alias.as_bytes(), space_id.as_bytes())?;
    debug!("allocated alias {alias} for space {space_id}");
    Ok(alias)
}
