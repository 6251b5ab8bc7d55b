pub mod analytics;
pub mod api;
pub mod model;
pub mod session;
pub mod store;
pub mod sync;
pub mod watch;

pub use session::{ClientConfig, FleetClient, SyncNotice};
pub use store::{EntityStore, FleetSnapshot};
pub use watch::StoreUpdate;
