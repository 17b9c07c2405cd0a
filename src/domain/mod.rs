pub mod cid;
pub mod ids;
pub mod relation;
pub mod smartblock;
pub mod value;

pub use relation::{keys, RelationFormat, RelationLink};
pub use smartblock::SmartBlockType;
pub use value::{Details, Value};
