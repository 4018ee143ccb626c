//! Multi-scanner advertisement fusion.

pub mod diagnostics;
pub mod manager;
pub mod matcher;
pub mod scanner;
pub mod state;
pub mod store;
pub mod tracker;

pub use manager::{Clock, FusionManager, Subscription};
pub use matcher::{MatchRule, Matcher};
pub use scanner::{ScannerHandle, ScannerInfo, ScannerKind};
