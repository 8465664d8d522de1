pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod presence;
pub mod session;
pub mod store;
pub mod typing;

pub use hub::Hub;
pub use store::ChatStore;
