//! Keeps the `backlinks` relation of every object in line with the inbound
//! link edges.
//!
//! The watcher listens to link diffs from all space indexes, folds them per
//! target over an aggregation window and then patches each target once. A
//! target that is open in an editor is not patched directly: the editor
//! boundary reopens it and its backlinks are recomputed from the stored
//! inbound edges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::app::{App, Component};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::domain::ids::VirtualId;
use crate::domain::{keys, Details};
use crate::error::{EngineError, Result};
use crate::objectstore::ObjectStore;
use crate::source::SourceRegistry;
use crate::spaceindex::{LinksUpdateInfo, SpaceIndex};

/// Access to objects that may be held open by an editor.
pub trait EditorBoundary: Send + Sync {
    /// Runs `f` while `id` is guaranteed not to be open. Returns
    /// `ObjectCached` without running `f` when it is.
    fn do_locked_if_not_exists(&self, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Runs `f` with `id` held open.
    fn do_open(&self, space_id: &str, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Boundary for a process with no editor cache: nothing is ever open.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedEditor;

impl EditorBoundary for DetachedEditor {
    fn do_locked_if_not_exists(&self, _id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        f()
    }

    fn do_open(&self, _space_id: &str, _id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        f()
    }
}

/// Treats sources leased from the registry as the open set.
pub struct RegistryEditor {
    registry: Arc<SourceRegistry>,
}

impl RegistryEditor {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }
}

impl EditorBoundary for RegistryEditor {
    fn do_locked_if_not_exists(&self, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        if self.registry.is_open(id) {
            return Err(EngineError::ObjectCached(id.to_string()));
        }
        f()
    }

    fn do_open(&self, space_id: &str, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let _lease = self.registry.acquire(space_id, id)?;
        f()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct BacklinksDiff {
    added: Vec<String>,
    removed: Vec<String>,
}

impl BacklinksDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// An `added` entry means the link did not exist before the window, so a
    /// later removal cancels it instead of being recorded. Same the other way.
    fn add(&mut self, from: &str) {
        if let Some(pos) = self.removed.iter().position(|r| r == from) {
            self.removed.remove(pos);
        } else if !self.added.iter().any(|a| a == from) {
            self.added.push(from.to_string());
        }
    }

    fn remove(&mut self, from: &str) {
        if let Some(pos) = self.added.iter().position(|a| a == from) {
            self.added.remove(pos);
        } else if !self.removed.iter().any(|r| r == from) {
            self.removed.push(from.to_string());
        }
    }

    /// `current` with removals dropped and additions appended.
    fn apply_to(&self, current: Vec<String>) -> Vec<String> {
        let mut next: Vec<String> = current.into_iter().filter(|b| !self.removed.contains(b)).collect();
        for added in &self.added {
            if !next.contains(added) {
                next.push(added.clone());
            }
        }
        next
    }
}

/// Pending diffs keyed by (space id, target id).
#[derive(Debug, Default)]
struct Accumulator {
    targets: BTreeMap<(String, String), BacklinksDiff>,
}

impl Accumulator {
    fn apply(&mut self, info: &LinksUpdateInfo) {
        let from = info.links_from_id.as_str();
        if from.is_empty() {
            return;
        }
        for target in info.removed.iter().filter(|t| t.as_str() != from) {
            self.entry(&info.space_id, target).remove(from);
        }
        for target in info.added.iter().filter(|t| t.as_str() != from) {
            self.entry(&info.space_id, target).add(from);
        }
    }

    fn entry(&mut self, space_id: &str, target: &str) -> &mut BacklinksDiff {
        self.targets
            .entry((space_id.to_string(), target.to_string()))
            .or_default()
    }

    fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn take(&mut self) -> BTreeMap<(String, String), BacklinksDiff> {
        std::mem::take(&mut self.targets)
    }
}

struct Shared {
    store: Arc<ObjectStore>,
    editor: Arc<dyn EditorBoundary>,
    updates: Receiver<LinksUpdateInfo>,
    pending: Mutex<Accumulator>,
    flushing: Mutex<()>,
}

impl Shared {
    fn accumulate(&self, info: &LinksUpdateInfo) {
        self.pending.lock().apply(info);
    }

    fn drain_channel(&self) {
        let mut pending = self.pending.lock();
        for info in self.updates.try_iter() {
            pending.apply(&info);
        }
    }

    fn flush(&self) {
        let _flushing = self.flushing.lock();
        let targets = self.pending.lock().take();
        if targets.is_empty() {
            return;
        }
        debug!("updating backlinks of {} objects", targets.len());
        for ((space_id, target), diff) in targets {
            if diff.is_empty() {
                continue;
            }
            if let Err(e) = self.patch_target(&space_id, &target, &diff) {
                warn!("failed to update backlinks of {target} in {space_id}: {e}");
            }
        }
    }

    /// Date objects, bundled records and system blocks never track backlinks.
    fn keeps_backlinks(&self, id: &str) -> bool {
        if VirtualId::parse(id).is_some() {
            return false;
        }
        match self.store.common().get_smartblock_type(id) {
            Ok(Some(sb_type)) => sb_type.keeps_backlinks(),
            _ => true,
        }
    }

    fn filtered(&self, backlinks: Vec<String>) -> Vec<String> {
        backlinks.into_iter().filter(|b| self.keeps_backlinks(b)).collect()
    }

    fn patch_target(&self, space_id: &str, target: &str, diff: &BacklinksDiff) -> Result<()> {
        if !self.keeps_backlinks(target) {
            return Ok(());
        }
        let space = self.store.space_index(space_id)?;
        let stored = space.get_details(target)?;
        if stored.get_bool(keys::IS_DELETED) {
            return Ok(());
        }
        if stored.is_empty() {
            // Not indexed yet; the first details write picks this up.
            return space.update_pending_local_details(target, |mut pending| {
                let next = self.filtered(diff.apply_to(pending.get_list(keys::BACKLINKS)));
                pending.set(keys::BACKLINKS, next);
                Ok(Some(pending))
            });
        }

        let mut modify = || {
            space.modify_object_details(target, |mut details: Details| {
                if details.is_empty() || details.get_bool(keys::IS_DELETED) {
                    return Err(EngineError::DetailsNotChanged);
                }
                let next = self.filtered(diff.apply_to(details.get_list(keys::BACKLINKS)));
                details.set(keys::BACKLINKS, next);
                Ok(Some(details))
            })
        };
        match self.editor.do_locked_if_not_exists(target, &mut modify) {
            Err(EngineError::ObjectCached(_)) => {
                debug!("{target} is open, recomputing its backlinks");
                self.editor
                    .do_open(space_id, target, &mut || self.recompute(&space, target))
            }
            other => other,
        }
    }

    fn recompute(&self, space: &SpaceIndex, target: &str) -> Result<()> {
        let inbound = self.filtered(space.get_inbound_links_by_id(target)?);
        space.modify_object_details(target, |mut details| {
            if details.is_empty() || details.get_bool(keys::IS_DELETED) {
                return Err(EngineError::DetailsNotChanged);
            }
            details.set(keys::BACKLINKS, inbound.clone());
            Ok(Some(details))
        })
    }
}

/// Aggregates link diffs and patches backlinks once the stream goes quiet
/// for one aggregation interval.
pub struct BacklinksWatcher {
    shared: Arc<Shared>,
    interval: Duration,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BacklinksWatcher {
    /// Subscribes right away, so diffs published before [`run`](Self::run)
    /// are not lost.
    pub fn new(config: &EngineConfig, store: Arc<ObjectStore>, editor: Arc<dyn EditorBoundary>) -> Self {
        let updates = store.subscribe_links_update();
        Self {
            shared: Arc::new(Shared {
                store,
                editor,
                updates,
                pending: Mutex::new(Accumulator::default()),
                flushing: Mutex::new(()),
            }),
            interval: config.backlinks_interval(),
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn run(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let shared = self.shared.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("backlinks-watcher".into())
            .spawn(move || watch(shared, stop_rx, interval))?;
        *self.stop.lock() = Some(stop_tx);
        *handle = Some(spawned);
        info!("backlinks watcher started, aggregation {:?}", self.interval);
        Ok(())
    }

    /// Applies everything received so far on the calling thread.
    pub fn flush_updates(&self) {
        self.shared.drain_channel();
        self.shared.flush();
    }

    /// Stops the worker after a final flush.
    pub fn close(&self) {
        self.stop.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("backlinks watcher thread panicked");
            }
        }
    }
}

impl Drop for BacklinksWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn watch(shared: Arc<Shared>, stop: Receiver<()>, interval: Duration) {
    let mut last_received: Option<Instant> = None;
    loop {
        select! {
            recv(shared.updates) -> msg => match msg {
                Ok(info) => {
                    shared.accumulate(&info);
                    last_received = Some(Instant::now());
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
            default(interval) => {}
        }
        if last_received.is_some_and(|at| at.elapsed() >= interval) && !shared.pending.lock().is_empty() {
            shared.flush();
            last_received = None;
        }
    }
    shared.drain_channel();
    shared.flush();
    debug!("backlinks watcher stopped");
}

impl Component for BacklinksWatcher {
    fn name(&self) -> &'static str {
        "backlinks"
    }

    fn init(&self, app: &App) -> Result<()> {
        app.component::<ObjectStore>()?;
        Ok(())
    }

    fn run(&self, _ctx: &Context) -> Result<()> {
        BacklinksWatcher::run(self)
    }

    fn close(&self) -> Result<()> {
        BacklinksWatcher::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::domain::ids::date_object_id;

    fn info(from: &str, added: &[&str], removed: &[&str]) -> LinksUpdateInfo {
        LinksUpdateInfo {
            space_id: "spc1".into(),
            links_from_id: from.into(),
            added: added.iter().map(|s| s.to_string()).collect(),
            removed: removed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[derive(Default)]
    struct CountingEditor {
        calls: Mutex<Vec<String>>,
        cached: Vec<String>,
        opened: Mutex<Vec<String>>,
    }

    impl EditorBoundary for CountingEditor {
        fn do_locked_if_not_exists(&self, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
            self.calls.lock().push(id.to_string());
            if self.cached.iter().any(|c| c == id) {
                return Err(EngineError::ObjectCached(id.to_string()));
            }
            f()
        }

        fn do_open(&self, _space_id: &str, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
            self.opened.lock().push(id.to_string());
            f()
        }
    }

    struct Fixture {
        store: Arc<ObjectStore>,
        watcher: BacklinksWatcher,
        editor: Arc<CountingEditor>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(editor: CountingEditor, interval_ms: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            map_size: 16 * 1024 * 1024,
            backlinks_aggregation_ms: interval_ms,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path());
        let store = Arc::new(ObjectStore::open(&config, None).unwrap());
        let editor = Arc::new(editor);
        let watcher = BacklinksWatcher::new(&config, store.clone(), editor.clone());
        Fixture {
            store,
            watcher,
            editor,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CountingEditor::default(), 50)
    }

    fn create(fx: &Fixture, ids: &[&str]) -> Arc<SpaceIndex> {
        let space = fx.store.space_index("spc1").unwrap();
        for id in ids {
            let mut d = Details::with_id(id);
            d.set(keys::NAME, *id);
            space.update_object_details(&Context::new(), id, d).unwrap();
        }
        space
    }

    fn backlinks(space: &SpaceIndex, id: &str) -> Vec<String> {
        space.get_details(id).unwrap().get_list(keys::BACKLINKS)
    }

    #[test]
    fn test_window_folds_diffs_per_target() {
        let mut acc = Accumulator::default();
        acc.apply(&info("obj1", &["obj2", "obj3"], &[]));
        acc.apply(&info("obj1", &["obj4", "obj5"], &["obj2"]));
        acc.apply(&info("obj1", &["obj6"], &["obj5"]));

        let touched: Vec<String> = acc
            .take()
            .into_iter()
            .filter(|(_, diff)| !diff.is_empty())
            .map(|((_, target), _)| target)
            .collect();
        assert_eq!(touched, vec!["obj3", "obj4", "obj6"]);
    }

    #[test]
    fn test_remove_then_add_cancels_and_self_links_are_dropped() {
        let mut acc = Accumulator::default();
        acc.apply(&info("obj1", &[], &["obj2"]));
        acc.apply(&info("obj1", &["obj2", "obj1"], &["obj1"]));
        let targets = acc.take();
        assert!(targets.values().all(BacklinksDiff::is_empty));
        assert!(!targets.contains_key(&("spc1".to_string(), "obj1".to_string())));
    }

    #[test]
    fn test_links_converge_to_backlinks() {
        let fx = fixture();
        let space = create(&fx, &["obj1", "obj2", "obj3"]);

        space
            .update_object_links("obj1", &["obj2".to_string(), "obj3".to_string()])
            .unwrap();
        fx.watcher.flush_updates();
        assert_eq!(backlinks(&space, "obj2"), vec!["obj1"]);
        assert_eq!(backlinks(&space, "obj3"), vec!["obj1"]);

        space.update_object_links("obj1", &[]).unwrap();
        fx.watcher.flush_updates();
        assert!(backlinks(&space, "obj2").is_empty());
        assert!(backlinks(&space, "obj3").is_empty());
    }

    #[test]
    fn test_each_touched_target_is_modified_once() {
        let fx = fixture();
        let space = create(&fx, &["obj1", "obj2", "obj3", "obj4", "obj5", "obj6"]);
        space.update_object_links("obj1", &["obj2".into(), "obj3".into()]).unwrap();
        space
            .update_object_links("obj1", &["obj3".into(), "obj4".into(), "obj5".into()])
            .unwrap();
        space
            .update_object_links("obj1", &["obj3".into(), "obj4".into(), "obj6".into()])
            .unwrap();
        fx.watcher.flush_updates();

        let mut calls = fx.editor.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["obj3", "obj4", "obj6"]);
        for id in ["obj3", "obj4", "obj6"] {
            assert_eq!(backlinks(&space, id), vec!["obj1"]);
        }
        assert!(backlinks(&space, "obj2").is_empty());
    }

    #[test]
    fn test_open_target_recomputes_from_inbound_edges() {
        let editor = CountingEditor {
            cached: vec!["obj2".to_string()],
            ..CountingEditor::default()
        };
        let fx = fixture_with(editor, 50);
        let space = create(&fx, &["obj1", "obj2", "obj3"]);
        space.update_object_links("obj3", &["obj2".to_string()]).unwrap();
        space.update_object_links("obj1", &["obj2".to_string()]).unwrap();
        fx.watcher.flush_updates();

        assert_eq!(fx.editor.opened.lock().clone(), vec!["obj2"]);
        let mut got = backlinks(&space, "obj2");
        got.sort();
        assert_eq!(got, vec!["obj1", "obj3"]);
    }

    #[test]
    fn test_unindexed_target_is_staged() {
        let fx = fixture();
        let space = create(&fx, &["obj1"]);
        space.update_object_links("obj1", &["later".to_string()]).unwrap();
        fx.watcher.flush_updates();

        let pending = space.get_pending_local_details("later").unwrap().unwrap();
        assert_eq!(pending.get_list(keys::BACKLINKS), vec!["obj1"]);
        create(&fx, &["later"]);
        assert_eq!(backlinks(&space, "later"), vec!["obj1"]);
    }

    #[test]
    fn test_date_targets_are_skipped() {
        let fx = fixture();
        let date = date_object_id(chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let space = create(&fx, &["obj1"]);
        space.update_object_links("obj1", &[date.clone()]).unwrap();
        fx.watcher.flush_updates();
        assert!(fx.editor.calls.lock().is_empty());
        assert!(space.get_pending_local_details(&date).unwrap().is_none());
    }

    #[test]
    fn test_parallel_patches_of_one_target_keep_every_source() {
        let fx = fixture();
        let space = create(&fx, &["target"]);
        let shared = fx.watcher.shared.clone();
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let mut diff = BacklinksDiff::default();
                    diff.add(&format!("src{i}"));
                    shared.patch_target("spc1", "target", &diff).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let mut got = backlinks(&space, "target");
        got.sort();
        let want: Vec<String> = (0..8).map(|i| format!("src{i}")).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_background_watcher_flushes_after_quiet_period() {
        let fx = fixture_with(CountingEditor::default(), 20);
        let space = create(&fx, &["obj1", "obj2"]);
        fx.watcher.run().unwrap();
        space.update_object_links("obj1", &["obj2".to_string()]).unwrap();
        for _ in 0..200 {
            if !backlinks(&space, "obj2").is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        fx.watcher.close();
        assert_eq!(backlinks(&space, "obj2"), vec!["obj1"]);
    }
}
