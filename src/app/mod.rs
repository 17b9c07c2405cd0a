//! Component registry with an explicit lifecycle.
//!
//! Components are registered in start order. [`App::start`] runs every
//! `init` first and then every `run`; [`App::close`] walks the list backwards.
//! While a component initialises, each [`App::component`] call it makes is
//! recorded as an edge of the [`DependencyGraph`] when collection is on.

pub mod depgraph;

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

pub use depgraph::DependencyGraph;

use crate::context::Context;
use crate::error::{EngineError, Result};

pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Looks up collaborators. Nothing may be started here.
    fn init(&self, _app: &App) -> Result<()> {
        Ok(())
    }

    /// Starts background work.
    fn run(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct Entry {
    component: Arc<dyn Component>,
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct App {
    entries: Vec<Entry>,
    initialising: Mutex<Option<&'static str>>,
    graph: Option<Mutex<DependencyGraph>>,
    graph_path: Option<PathBuf>,
    started: Mutex<usize>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records injection edges and writes them as Graphviz to `path` once
    /// every component is initialised.
    pub fn with_dependency_graph(mut self, path: PathBuf) -> Self {
        self.graph = Some(Mutex::new(DependencyGraph::new()));
        self.graph_path = Some(path);
        self
    }

    pub fn register<T: Component>(&mut self, component: Arc<T>) -> &mut Self {
        let any: Arc<dyn Any + Send + Sync> = component.clone();
        self.entries.push(Entry { component, any });
        self
    }

    /// The registered component of type `T`.
    pub fn component<T: Component>(&self) -> Result<Arc<T>> {
        let found = self
            .entries
            .iter()
            .find_map(|e| e.any.clone().downcast::<T>().ok())
            .ok_or_else(|| {
                EngineError::Internal(format!("component {} is not registered", std::any::type_name::<T>()))
            })?;
        if let (Some(graph), Some(caller)) = (&self.graph, *self.initialising.lock()) {
            graph.lock().add_edge(caller, found.name());
        }
        Ok(found)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.component.name()).collect()
    }

    /// Inits every component, then runs them in registration order. When a
    /// step fails, the components already running are closed again.
    pub fn start(&self, ctx: &Context) -> Result<()> {
        for entry in &self.entries {
            let name = entry.component.name();
            if let Some(graph) = &self.graph {
                graph.lock().add_node(name);
            }
            *self.initialising.lock() = Some(name);
            let result = entry.component.init(self);
            *self.initialising.lock() = None;
            result.map_err(|e| EngineError::Internal(format!("init {name}: {e}")))?;
            debug!("component {name} initialised");
        }
        self.write_graph();

        for (i, entry) in self.entries.iter().enumerate() {
            if let Err(e) = ctx.check().and_then(|()| entry.component.run(ctx)) {
                warn!("component {} failed to start: {e}", entry.component.name());
                *self.started.lock() = i;
                self.close_started();
                return Err(e);
            }
            *self.started.lock() = i + 1;
        }
        info!("started {} components", self.entries.len());
        Ok(())
    }

    /// Closes running components in reverse order. Every component is
    /// closed even when an earlier close fails; the first error is returned.
    pub fn close(&self) -> Result<()> {
        self.close_started()
    }

    pub fn dependency_graph(&self) -> Option<DependencyGraph> {
        self.graph.as_ref().map(|g| g.lock().clone())
    }

    fn close_started(&self) -> Result<()> {
        let started = std::mem::take(&mut *self.started.lock());
        let mut first_err = None;
        for entry in self.entries[..started].iter().rev() {
            match entry.component.close() {
                Ok(()) => debug!("component {} closed", entry.component.name()),
                Err(e) => {
                    warn!("failed to close component {}: {e}", entry.component.name());
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn write_graph(&self) {
        let (Some(graph), Some(path)) = (&self.graph, &self.graph_path) else {
            return;
        };
        let graph = graph.lock();
        for cycle in graph.cycles() {
            warn!("dependency cycle: {}", cycle.join(" -> "));
        }
        if let Err(e) = graph.write_dot(path) {
            warn!("failed to write dependency graph: {e}");
        }
    }
}
