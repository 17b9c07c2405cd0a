//! # End-to-End Test Suite for the Local Object Engine
//!
//! Exercises the engine the way a host application does: through
//! [`Engine`](crate::Engine) and through the C ABI. Component-level behaviour
//! is covered by the `tests` module next to each component.
//!
//! ## Test Categories
//!
//! ### 1. Scenario Tests
//! - **Purpose**: Walk the documented end-to-end flows across components
//! - **Tests Include**:
//!   - Link diffs converging into backlinks
//!   - Backlink aggregation inside one window
//!   - Full-text search with a space filter
//!   - Change codec framing
//!   - Snapshot probability
//!   - Tombstones hiding objects from listings and search
//!
//! ### 2. FFI Function Tests
//! - **Purpose**: Test every `extern "C"` function with success and error inputs
//! - **Tests Include**:
//!   - `create_engine`, `engine_get_details`, `engine_query_space_views`
//!   - `engine_search`, `engine_index_object`, `engine_flush`, `close_engine`
//!   - Null pointers, invalid UTF-8, malformed JSON
//!
//! ### 3. Restart Tests
//! - **Purpose**: Verify state survives closing and reopening the same repository
//!
//! ## Running the Tests
//!
//! ```bash
//! cargo test test_scenario_   # end-to-end flows
//! cargo test test_ffi_        # C ABI
//! ```

#[cfg(test)]
pub mod tests {
    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::app_response::AppResponse;
    use crate::backlinks::EditorBoundary;
    use crate::change::snapshot::snapshot_chance;
    use crate::change::{
        marshal_change, unmarshal_change, Block, Change, ChangeContent, ChangePayload, COMPRESSED_DATA_TYPE,
    };
    use crate::config::EngineConfig;
    use crate::context::Context;
    use crate::domain::{keys, Details, SmartBlockType};
    use crate::engine::Engine;
    use crate::error::{EngineError, Result};
    use crate::ftsearch::{HighlightFormat, SearchDoc};
    use crate::objecttree::memory::{MemorySpace, MemorySpaceService, MemoryTreeBuilder};
    use crate::objecttree::ReadableObjectTree;
    use crate::source::PushChangeParams;
    use crate::spaceindex::SpaceIndex;

    fn test_config(dir: &tempfile::TempDir, backlinks_ms: u64) -> EngineConfig {
        EngineConfig {
            map_size: 16 * 1024 * 1024,
            backlinks_aggregation_ms: backlinks_ms,
            fulltext_interval_ms: 60_000,
            index_bundled_objects: false,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path())
    }

    fn create_objects(space: &SpaceIndex, ids: &[&str]) {
        for id in ids {
            let mut details = Details::with_id(id);
            details.set(keys::NAME, *id);
            space.update_object_details(&Context::new(), id, details).unwrap();
        }
    }

    fn backlinks(space: &SpaceIndex, id: &str) -> Vec<String> {
        space.get_details(id).unwrap().get_list(keys::BACKLINKS)
    }

    /// Polls `cond` until it holds or `timeout` passes.
    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    /// Records every target the watcher patches.
    #[derive(Default)]
    struct RecordingEditor {
        patched: Mutex<Vec<String>>,
    }

    impl EditorBoundary for RecordingEditor {
        fn do_locked_if_not_exists(&self, id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
            self.patched.lock().push(id.to_string());
            f()
        }

        fn do_open(&self, _space_id: &str, _id: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
            f()
        }
    }

    /// Reads a returned C string, frees it and parses the envelope.
    fn take_response(ptr: *const c_char) -> AppResponse {
        assert!(!ptr.is_null(), "Response pointer should not be null");
        let raw = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        crate::free_response(ptr);
        serde_json::from_str(&raw).unwrap()
    }

    fn ok_body(response: AppResponse) -> String {
        match response {
            AppResponse::Ok(body) => body,
            other => panic!("Expected Ok, got {other}"),
        }
    }

    fn config_json(dir: &tempfile::TempDir) -> CString {
        let json = serde_json::json!({
            "repo_path": dir.path(),
            "map_size": 16 * 1024 * 1024,
            "backlinks_aggregation_ms": 20,
            "fulltext_interval_ms": 20,
        });
        CString::new(json.to_string()).unwrap()
    }

    // ===============================
    // SCENARIO TESTS
    // ===============================

    #[test]
    fn test_scenario_link_diff_converges_to_backlinks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(&dir, 50)).unwrap();
        let space = engine.object_store().space_index("spc1").unwrap();
        create_objects(&space, &["obj1", "obj2", "obj3"]);

        space
            .update_object_links("obj1", &["obj2".to_string(), "obj3".to_string()])
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            backlinks(&space, "obj2") == vec!["obj1"] && backlinks(&space, "obj3") == vec!["obj1"]
        }));

        space.update_object_links("obj1", &[]).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            backlinks(&space, "obj2").is_empty() && backlinks(&space, "obj3").is_empty()
        }));
        engine.close().unwrap();
    }

    #[test]
    fn test_scenario_backlink_aggregation_in_one_window() {
        let dir = tempfile::tempdir().unwrap();
        let editor = Arc::new(RecordingEditor::default());
        let engine = Engine::open_with(
            test_config(&dir, 1000),
            Arc::new(MemorySpaceService::default()),
            Some(editor.clone() as Arc<dyn EditorBoundary>),
        )
        .unwrap();
        let space = engine.object_store().space_index("spc1").unwrap();
        create_objects(&space, &["obj1", "obj2", "obj3", "obj4", "obj5", "obj6"]);

        // +{obj2,obj3}, then +{obj4,obj5} -{obj2}, then +{obj6} -{obj5}
        space.update_object_links("obj1", &["obj2".into(), "obj3".into()]).unwrap();
        space
            .update_object_links("obj1", &["obj3".into(), "obj4".into(), "obj5".into()])
            .unwrap();
        space
            .update_object_links("obj1", &["obj3".into(), "obj4".into(), "obj6".into()])
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            ["obj3", "obj4", "obj6"]
                .iter()
                .all(|id| backlinks(&space, id) == vec!["obj1"])
        }));
        let mut patched = editor.patched.lock().clone();
        patched.sort();
        assert_eq!(patched, vec!["obj3", "obj4", "obj6"]);
        for id in ["obj2", "obj5"] {
            assert!(backlinks(&space, id).is_empty());
        }
        engine.close().unwrap();
    }

    #[test]
    fn test_scenario_full_text_search_with_space_filter() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(&dir, 50)).unwrap();
        let fts = engine.full_text();
        fts.index(SearchDoc::new("id1.1", "first", "Dashboard of first space", "")).unwrap();
        fts.index(SearchDoc::new("id1.2", "first", "Advanced of first space", "")).unwrap();
        fts.index(SearchDoc::new("id2.1", "second", "Dashboard of second space", "")).unwrap();
        fts.index(SearchDoc::new("id2.2", "second", "Advanced of second space", "")).unwrap();
        fts.index(SearchDoc::new("id0", "", "My favorite coffee brands", "")).unwrap();

        let hits = engine
            .search(&["first".to_string()], "Dashboard", HighlightFormat::Text)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "id1.1");

        let hits = engine
            .search(&["second".to_string()], "space", HighlightFormat::Text)
            .unwrap();
        assert_eq!(hits.len(), 2);

        let hits = engine.search(&[], "coffee", HighlightFormat::Text).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "id0");

        assert!(engine.search(&[], "", HighlightFormat::Text).unwrap().is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn test_scenario_change_codec() {
        let small = Change {
            content: vec![ChangeContent::BlockSetText {
                id: "b".into(),
                text: "1234567".into(),
            }],
            ..Change::default()
        };
        let framed = marshal_change(&small).unwrap();
        assert_eq!(framed.data_type, "");

        let large = Change {
            content: vec![ChangeContent::details_set(keys::NAME, "x".repeat(200))],
            ..Change::default()
        };
        let compressed = marshal_change(&large).unwrap();
        assert_eq!(compressed.data_type, COMPRESSED_DATA_TYPE);
        assert!(matches!(
            unmarshal_change(&compressed.data, ""),
            Err(EngineError::Codec(_))
        ));
        assert_eq!(unmarshal_change(&compressed.data, COMPRESSED_DATA_TYPE).unwrap(), large);

        // Raw bytes mistagged as compressed still decode.
        assert_eq!(unmarshal_change(&framed.data, COMPRESSED_DATA_TYPE).unwrap(), small);
    }

    #[test]
    fn test_scenario_snapshot_probability() {
        let mut rng = StdRng::seed_from_u64(42);
        assert!((0..50_000).all(|_| !snapshot_chance(&mut rng, 50)));

        let trials = 50_000;
        let hits = (0..trials).filter(|_| snapshot_chance(&mut rng, 5000)).count();
        let rate = hits as f64 / trials as f64;
        assert!((0.01..=0.05).contains(&rate), "rate {rate}");
    }

    #[test]
    fn test_scenario_tombstone_hides_object() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(&dir, 50)).unwrap();
        let space = engine.object_store().space_index("spc1").unwrap();
        let mut details = Details::with_id("id1");
        details.set(keys::NAME, "n");
        space.update_object_details(&Context::new(), "id1", details).unwrap();
        engine.flush().unwrap();
        assert!(engine.full_text().has_doc("id1/r/name"));

        space.delete_object("id1").unwrap();
        engine.flush().unwrap();

        let mut expected = Details::with_id("id1");
        expected.set(keys::IS_DELETED, true);
        assert_eq!(engine.get_details("id1").unwrap(), expected);
        assert!(!space.list_ids().unwrap().contains(&"id1".to_string()));
        assert!(engine
            .search(&["spc1".to_string()], "n", HighlightFormat::Text)
            .unwrap()
            .is_empty());
        assert!(!engine.full_text().has_doc("id1/r/name"));

        // Deleting twice is indistinguishable from deleting once.
        assert_eq!(space.delete_object("id1").unwrap(), expected);
        engine.close().unwrap();
    }

    #[test]
    fn test_scenario_tree_object_indexes_links_and_backlinks() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MemoryTreeBuilder::new("alice"));
        let spaces = Arc::new(MemorySpaceService::default());
        spaces.add(Arc::new(MemorySpace::new("spc1", builder.clone())));
        let engine = Engine::open_with(test_config(&dir, 20), spaces, None).unwrap();
        let space = engine.object_store().space_index("spc1").unwrap();
        create_objects(&space, &["target"]);

        let tree = builder
            .create_memory_tree(
                ChangePayload {
                    smartblock_type: SmartBlockType::Page,
                    key: String::new(),
                },
                1_700_000_000,
            )
            .unwrap();
        let id = tree.id();
        {
            let lease = engine.sources().acquire("spc1", &id).unwrap();
            lease
                .push_change(PushChangeParams::with_content(vec![
                    ChangeContent::details_set(keys::NAME, "Source page"),
                    ChangeContent::BlockCreate {
                        target_id: String::new(),
                        blocks: vec![Block::link("l1", "target")],
                    },
                ]))
                .unwrap();
        }
        engine.index_object("spc1", &id).unwrap();
        engine.flush().unwrap();

        assert_eq!(space.get_outbound_links_by_id(&id).unwrap(), vec!["target".to_string()]);
        assert!(wait_until(Duration::from_secs(5), || backlinks(&space, "target") == vec![id.clone()]));
        engine.close().unwrap();
    }

    // ===============================
    // FFI FUNCTION TESTS
    // ===============================

    #[test]
    fn test_ffi_create_engine_success() {
        use crate::{close_engine, create_engine};

        let dir = tempfile::tempdir().unwrap();
        let config = config_json(&dir);
        let engine = create_engine(config.as_ptr());
        assert!(!engine.is_null(), "Engine pointer should not be null");

        let body = ok_body(take_response(close_engine(engine)));
        assert!(body.contains("closed"));
    }

    #[test]
    fn test_ffi_create_engine_null_pointer() {
        use crate::create_engine;

        assert!(create_engine(std::ptr::null()).is_null());
    }

    #[test]
    fn test_ffi_create_engine_invalid_input() {
        use crate::create_engine;

        let invalid_bytes = [0xFF_u8, 0xFE, 0xFD, 0x00];
        assert!(create_engine(invalid_bytes.as_ptr() as *const c_char).is_null());

        let malformed = CString::new("{not json").unwrap();
        assert!(create_engine(malformed.as_ptr()).is_null());
    }

    #[test]
    fn test_ffi_get_details() {
        use crate::{close_engine, create_engine, engine_get_details};

        let dir = tempfile::tempdir().unwrap();
        let config = config_json(&dir);
        let engine = create_engine(config.as_ptr());
        assert!(!engine.is_null());
        {
            let space = unsafe { &*engine }.object_store().space_index("spc1").unwrap();
            create_objects(&space, &["obj1"]);
        }

        let id = CString::new("obj1").unwrap();
        let body = ok_body(take_response(engine_get_details(engine, id.as_ptr())));
        let details: Details = serde_json::from_str(&body).unwrap();
        assert_eq!(details.get_str(keys::NAME), Some("obj1"));
        assert_eq!(details.get_str(keys::SPACE_ID), Some("spc1"));

        let missing = CString::new("ghost").unwrap();
        assert!(matches!(
            take_response(engine_get_details(engine, missing.as_ptr())),
            AppResponse::NotFound(_)
        ));

        take_response(close_engine(engine));
    }

    #[test]
    fn test_ffi_null_pointers() {
        use crate::{
            close_engine, engine_flush, engine_get_details, engine_index_object, engine_query_space_views,
            engine_search,
        };

        let id = CString::new("obj1").unwrap();
        let null = std::ptr::null_mut();
        assert!(matches!(take_response(engine_get_details(null, id.as_ptr())), AppResponse::BadRequest(_)));
        assert!(matches!(
            take_response(engine_query_space_views(null, id.as_ptr())),
            AppResponse::BadRequest(_)
        ));
        assert!(matches!(
            take_response(engine_search(null, id.as_ptr(), id.as_ptr(), false)),
            AppResponse::BadRequest(_)
        ));
        assert!(matches!(
            take_response(engine_index_object(null, id.as_ptr(), id.as_ptr())),
            AppResponse::BadRequest(_)
        ));
        assert!(matches!(take_response(engine_flush(null)), AppResponse::BadRequest(_)));
        assert!(matches!(take_response(close_engine(null)), AppResponse::BadRequest(_)));
        crate::free_response(std::ptr::null());
    }

    #[test]
    fn test_ffi_null_arguments_on_live_engine() {
        use crate::{close_engine, create_engine, engine_get_details, engine_search};

        let dir = tempfile::tempdir().unwrap();
        let config = config_json(&dir);
        let engine = create_engine(config.as_ptr());
        assert!(!engine.is_null());

        assert!(matches!(
            take_response(engine_get_details(engine, std::ptr::null())),
            AppResponse::BadRequest(_)
        ));
        let spaces = CString::new("[]").unwrap();
        assert!(matches!(
            take_response(engine_search(engine, spaces.as_ptr(), std::ptr::null(), false)),
            AppResponse::BadRequest(_)
        ));
        take_response(close_engine(engine));
    }

    #[test]
    fn test_ffi_query_space_views() {
        use crate::{close_engine, create_engine, engine_query_space_views};

        let dir = tempfile::tempdir().unwrap();
        let config = config_json(&dir);
        let engine = create_engine(config.as_ptr());
        assert!(!engine.is_null());

        let filters = CString::new("[]").unwrap();
        let body = ok_body(take_response(engine_query_space_views(engine, filters.as_ptr())));
        let result: crate::database::QueryResult = serde_json::from_str(&body).unwrap();
        assert!(result.records.is_empty());

        let malformed = CString::new("{").unwrap();
        assert!(matches!(
            take_response(engine_query_space_views(engine, malformed.as_ptr())),
            AppResponse::SerializationError(_)
        ));
        take_response(close_engine(engine));
    }

    #[test]
    fn test_ffi_search_and_flush() {
        use crate::{close_engine, create_engine, engine_flush, engine_search};

        let dir = tempfile::tempdir().unwrap();
        let config = config_json(&dir);
        let engine = create_engine(config.as_ptr());
        assert!(!engine.is_null());
        {
            let space = unsafe { &*engine }.object_store().space_index("spc1").unwrap();
            let mut details = Details::with_id("obj1");
            details.set(keys::NAME, "Quarterly report");
            details.set(keys::DESCRIPTION, "numbers for the quarterly review");
            space.update_object_details(&Context::new(), "obj1", details).unwrap();
        }
        ok_body(take_response(engine_flush(engine)));

        let spaces = CString::new(r#"["spc1"]"#).unwrap();
        let text = CString::new("quarterly").unwrap();
        let body = ok_body(take_response(engine_search(engine, spaces.as_ptr(), text.as_ptr(), true)));
        let hits: Vec<crate::ftsearch::SearchHit> = serde_json::from_str(&body).unwrap();
        assert_eq!(hits.len(), 2);
        let description = hits.iter().find(|h| h.id == "obj1/r/description").unwrap();
        assert!(description.highlight.contains("<b>quarterly</b>"));

        let bad_spaces = CString::new("spc1").unwrap();
        assert!(matches!(
            take_response(engine_search(engine, bad_spaces.as_ptr(), text.as_ptr(), false)),
            AppResponse::SerializationError(_)
        ));
        take_response(close_engine(engine));
    }

    #[test]
    fn test_ffi_index_object_unknown_space() {
        use crate::{close_engine, create_engine, engine_index_object};

        let dir = tempfile::tempdir().unwrap();
        let config = config_json(&dir);
        let engine = create_engine(config.as_ptr());
        assert!(!engine.is_null());

        let space_id = CString::new("nowhere").unwrap();
        let id = CString::new("plain-id").unwrap();
        let response = take_response(engine_index_object(engine, space_id.as_ptr(), id.as_ptr()));
        assert!(!matches!(response, AppResponse::Ok(_)));
        take_response(close_engine(engine));
    }

    // ===============================
    // RESTART TESTS
    // ===============================

    #[test]
    fn test_restart_keeps_details_and_docs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(test_config(&dir, 50)).unwrap();
            let space = engine.object_store().space_index("spc1").unwrap();
            let mut details = Details::with_id("obj1");
            details.set(keys::NAME, "Persistent");
            space.update_object_details(&Context::new(), "obj1", details).unwrap();
            engine.flush().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(test_config(&dir, 50)).unwrap();
        assert_eq!(engine.get_details("obj1").unwrap().get_str(keys::NAME), Some("Persistent"));
        assert!(engine.object_store().space_ids().contains(&"spc1".to_string()));
        let hits = engine
            .search(&["spc1".to_string()], "persistent", HighlightFormat::Text)
            .unwrap();
        assert_eq!(hits.len(), 1);
        engine.close().unwrap();
    }
}
