pub mod aggregator;
pub mod cache;
pub mod engine;
pub mod session;

pub use aggregator::{Aggregator, LeaderboardEntry, VehicleHistories};
pub use cache::{CacheKey, FeatureCache, FeatureTable, TableVariant};
pub use engine::StrategyEngine;
pub use session::{RaceSession, VehicleStrategy, VehicleUpdate};
