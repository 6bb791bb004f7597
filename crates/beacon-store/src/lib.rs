pub mod error;
pub mod fleets;
pub mod locations;
pub mod store;

pub use error::StoreError;
pub use store::EntityStore;
