pub mod bus;
pub mod cache;

pub use bus::{PriceEvent, PriceEventBus, PriceHandler, SubscriptionId};
pub use cache::PriceCache;
