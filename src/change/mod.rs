pub mod codec;
pub mod model;
pub mod snapshot;

pub use codec::{
    marshal_change, marshal_store_change, unmarshal_change, unmarshal_store_change, Framed,
    SnapshotSkippingDecoder, COMPRESSED_DATA_TYPE,
};
pub use model::{
    Block, Change, ChangeContent, ChangePayload, ChangeType, FileKeys, Snapshot, SnapshotData, CHANGE_VERSION,
    StoreChange, StoreOp,
};
