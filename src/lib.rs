//! # Local Object Engine
//!
//! Local-first object storage for a collaborative workspace, built on LMDB
//! (Lightning Memory-Mapped Database) and exposed through a C ABI that
//! returns JSON envelopes.
//!
//! Every object is a tree of signed changes. The engine materializes each
//! object into a per-space index of details and links, keeps a full-text
//! index in sync, maintains backlinks, and resolves which space an object
//! lives in.
//!
//! ## Layers
//!
//! - [`change`] and [`reducer`]: change codec and the state reducer
//! - [`source`]: uniform read/write access to tree, store, virtual and static objects
//! - [`spaceindex`] and [`objectstore`]: per-space index and the cross-space store
//! - [`ftsearch`]: full-text index with per-relation and per-block documents
//! - [`indexer`]: object indexing, full-text worker and startup reindex
//! - [`backlinks`]: aggregates link changes into backlink details
//! - [`app`]: component lifecycle and the bootstrap dependency graph
//! - [`engine`]: the process entry point that wires all of the above
//!
//! ## Quick Start
//!
//! ```no_run
//! use local_object_engine::{create_engine, engine_get_details, free_response};
//! use std::ffi::CString;
//!
//! let config = CString::new(r#"{"repo_path":"/tmp/objects"}"#).unwrap();
//! let engine = create_engine(config.as_ptr());
//!
//! let id = CString::new("bafyobject").unwrap();
//! let result = engine_get_details(engine, id.as_ptr());
//! free_response(result);
//! ```
//!
//! ## FFI Functions
//!
//! - [`create_engine`] - Open an engine from a JSON configuration
//! - [`engine_get_details`] - Details of one object
//! - [`engine_query_space_views`] - Filter query over the tech space views
//! - [`engine_search`] - Full-text search in a set of spaces
//! - [`engine_index_object`] - Index one object from its change tree now
//! - [`engine_flush`] - Apply pending backlinks and full-text work
//! - [`close_engine`] - Stop every component and free the engine
//! - [`free_response`] - Release a string returned by any of the above

pub mod app;
pub mod app_response;
pub mod backlinks;
pub mod bundle;
pub mod change;
pub mod config;
pub mod context;
pub mod database;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ftsearch;
pub mod indexer;
pub mod kv_store;
pub mod objectstore;
pub mod objecttree;
pub mod reducer;
pub mod source;
pub mod spaceindex;
pub mod state;
mod test;
pub mod typeprovider;

pub use crate::app_response::AppResponse;
pub use crate::config::EngineConfig;
pub use crate::context::Context;
pub use crate::engine::Engine;
pub use crate::error::{EngineError, Result};

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};

use crate::database::Filter;
use crate::ftsearch::HighlightFormat;

/// Opens an engine described by a JSON [`EngineConfig`].
///
/// Missing fields take their defaults, so `{"repo_path": "..."}` is enough.
/// Every component is started before the pointer is returned.
///
/// # Returns
///
/// A pointer to the [`Engine`], or null when the configuration is invalid
/// or any component fails to start. Release it with [`close_engine`].
///
/// # Safety
///
/// `config_json` must be a valid null-terminated C string.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_engine(config_json: *const c_char) -> *mut Engine {
    if config_json.is_null() {
        warn!("Null config pointer passed to create_engine");
        return std::ptr::null_mut();
    }

    let raw = match unsafe { CStr::from_ptr(config_json).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    let config = match EngineConfig::from_json_str(raw) {
        Ok(config) => config,
        Err(e) => {
            warn!("Invalid engine config: {e}");
            return std::ptr::null_mut();
        }
    };

    match Engine::open(config) {
        Ok(engine) => {
            info!("Engine opened at {}", engine.config().repo_path.display());
            Box::into_raw(Box::new(engine))
        }
        Err(e) => {
            warn!("Failed to open engine: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Returns the details of `id` as a JSON object inside an `Ok` envelope.
///
/// An id bound to no space yields `NotFound`.
///
/// # Safety
///
/// Both parameters must be valid pointers.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn engine_get_details(engine: *mut Engine, id: *const c_char) -> *const c_char {
    let engine = match engine_ref(engine, "engine_get_details") {
        Ok(engine) => engine,
        Err(error_ptr) => return error_ptr,
    };
    let id = match c_ptr_to_string(id, "id") {
        Ok(id) => id,
        Err(error_ptr) => return error_ptr,
    };

    match engine.get_details(&id) {
        Ok(details) => response_to_c_string(&AppResponse::json(&details)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Runs a filter query over the views of the tech space.
///
/// # JSON Format
///
/// `filters_json` is an array of filters. An empty array matches every view.
///
/// # Safety
///
/// Both parameters must be valid pointers.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn engine_query_space_views(engine: *mut Engine, filters_json: *const c_char) -> *const c_char {
    let engine = match engine_ref(engine, "engine_query_space_views") {
        Ok(engine) => engine,
        Err(error_ptr) => return error_ptr,
    };
    let raw = match c_ptr_to_string(filters_json, "filters") {
        Ok(raw) => raw,
        Err(error_ptr) => return error_ptr,
    };
    let filters: Vec<Filter> = match serde_json::from_str(&raw) {
        Ok(filters) => filters,
        Err(e) => return response_to_c_string(&AppResponse::from(e)),
    };

    match engine.query_space_views(filters) {
        Ok(result) => response_to_c_string(&AppResponse::json(&result)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Full-text search restricted to the spaces in `space_ids_json`.
///
/// Hits are returned best first. With `html` set, highlights wrap matches in
/// `<b>`; otherwise they come as plain fragments plus character ranges.
///
/// # Safety
///
/// All pointer parameters must be valid.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn engine_search(
    engine: *mut Engine,
    space_ids_json: *const c_char,
    text: *const c_char,
    html: bool,
) -> *const c_char {
    let engine = match engine_ref(engine, "engine_search") {
        Ok(engine) => engine,
        Err(error_ptr) => return error_ptr,
    };
    let raw = match c_ptr_to_string(space_ids_json, "space_ids") {
        Ok(raw) => raw,
        Err(error_ptr) => return error_ptr,
    };
    let text = match c_ptr_to_string(text, "text") {
        Ok(text) => text,
        Err(error_ptr) => return error_ptr,
    };
    let space_ids: Vec<String> = match serde_json::from_str(&raw) {
        Ok(ids) => ids,
        Err(e) => return response_to_c_string(&AppResponse::from(e)),
    };
    let format = if html { HighlightFormat::Html } else { HighlightFormat::Text };

    match engine.search(&space_ids, &text, format) {
        Ok(hits) => response_to_c_string(&AppResponse::json(&hits)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Opens `id` from its change tree in `space_id` and indexes it now.
///
/// Returns `"indexed"`, or `"unchanged"` when the heads are already indexed.
///
/// # Safety
///
/// All pointer parameters must be valid.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn engine_index_object(engine: *mut Engine, space_id: *const c_char, id: *const c_char) -> *const c_char {
    let engine = match engine_ref(engine, "engine_index_object") {
        Ok(engine) => engine,
        Err(error_ptr) => return error_ptr,
    };
    let space_id = match c_ptr_to_string(space_id, "space_id") {
        Ok(space_id) => space_id,
        Err(error_ptr) => return error_ptr,
    };
    let id = match c_ptr_to_string(id, "id") {
        Ok(id) => id,
        Err(error_ptr) => return error_ptr,
    };

    match engine.index_object(&space_id, &id) {
        Ok(outcome) => response_to_c_string(&AppResponse::success(outcome.as_str())),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Applies pending backlink updates and drains the full-text queue on the
/// calling thread.
///
/// # Safety
///
/// The engine parameter must be a valid pointer.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn engine_flush(engine: *mut Engine) -> *const c_char {
    let engine = match engine_ref(engine, "engine_flush") {
        Ok(engine) => engine,
        Err(error_ptr) => return error_ptr,
    };

    match engine.flush() {
        Ok(()) => response_to_c_string(&AppResponse::success("Flushed")),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Stops every component and frees the engine.
///
/// The pointer must not be used afterwards, even when the close reports an
/// error.
///
/// # Safety
///
/// The engine parameter must be a pointer returned by [`create_engine`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_engine(engine: *mut Engine) -> *const c_char {
    if engine.is_null() {
        let error = AppResponse::BadRequest("Null engine pointer passed to close_engine".to_string());
        return response_to_c_string(&error);
    }

    let engine = unsafe { Box::from_raw(engine) };
    let result = engine.close();
    drop(engine);

    match result {
        Ok(()) => response_to_c_string(&AppResponse::success("Engine closed successfully")),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Releases a string returned by any engine function. Null is ignored.
///
/// # Safety
///
/// `ptr` must come from this library and must not be freed twice.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr as *mut c_char) });
}

fn engine_ref<'a>(engine: *mut Engine, caller: &str) -> Result<&'a Engine, *const c_char> {
    if engine.is_null() {
        let error = AppResponse::BadRequest(format!("Null engine pointer passed to {caller}"));
        return Err(response_to_c_string(&error));
    }
    Ok(unsafe { &*engine })
}

/// Converts an [`AppResponse`] to a C-compatible string.
///
/// Returns a null pointer if serialization or C string creation fails.
/// The caller frees the result with [`free_response`].
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust String.
///
/// # Returns
///
/// * `Ok(String)` - If conversion was successful
/// * `Err(*const c_char)` - A `BadRequest` envelope for null pointers and invalid UTF-8
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
