pub mod cards;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod http;
pub mod merge;
pub mod orchestrator;
pub mod producers;
pub mod registry;
pub mod store;
pub mod utils;

pub use cards::{Card, CardCategory, GlobalContext};
pub use error::{ParallizerError, Result};
pub use feed::FeedService;
pub use merge::{MergePolicy, merge};
pub use producers::{Producer, ProducerRegistry};
