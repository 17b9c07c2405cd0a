use std::sync::Arc;

use parking_lot::Mutex;

use super::{ChangeReceiver, CreationInfo, PushChangeParams, Source, SourceKind};
use crate::change::FileKeys;
use crate::domain::SmartBlockType;
use crate::error::{EngineError, Result};
use crate::state::{apply_state_fast_one, State};

/// Pre-built in-memory document registered under a fixed id.
pub struct StaticSource {
    id: String,
    space_id: String,
    sb_type: SmartBlockType,
    read_only: bool,
    state: Mutex<State>,
    creation: CreationInfo,
}

impl StaticSource {
    pub fn new(space_id: &str, sb_type: SmartBlockType, state: State, read_only: bool) -> Self {
        Self {
            id: state.root_id().to_string(),
            space_id: space_id.to_string(),
            sb_type,
            read_only,
            state: Mutex::new(state),
            creation: CreationInfo::default(),
        }
    }

    pub fn with_creation_info(mut self, creation: CreationInfo) -> Self {
        self.creation = creation;
        self
    }
}

impl Source for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn smartblock_type(&self) -> SmartBlockType {
        self.sb_type
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read_doc(&self, _receiver: Option<Arc<dyn ChangeReceiver>>) -> Result<State> {
        let mut st = self.state.lock().clone();
        st.set_space_id(&self.space_id);
        st.set_smartblock_type(self.sb_type);
        Ok(st)
    }

    /// Applies content in memory only; nothing is appended anywhere.
    fn push_change(&self, params: PushChangeParams) -> Result<String> {
        if self.read_only {
            return Err(EngineError::ReadOnly(self.id.clone()));
        }
        let mut state = self.state.lock();
        let mut next = state.new_state();
        for item in &params.content {
            next.apply_change(item)?;
        }
        next.add_file_keys(&params.file_keys);
        let (next, _) = apply_state_fast_one(next)?;
        *state = next;
        Ok(String::new())
    }

    fn heads(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn file_keys_snapshot(&self) -> Vec<FileKeys> {
        self.state.lock().file_keys().to_vec()
    }

    fn creation_info(&self) -> Result<CreationInfo> {
        Ok(self.creation.clone())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
