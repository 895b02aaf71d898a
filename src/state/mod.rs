pub mod diff;
pub mod path_ops;

pub use diff::{DiffCache, StateDiff};
pub use path_ops::{
    cleanup_empty_parents, delete_value, extract_leaves, get_value, set_value, Leaf,
};
