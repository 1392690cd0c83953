pub mod node_manager;

pub use node_manager::{DeletionCounters, NodeManager, PromotionStats};
