pub mod account;
pub mod authorization;
pub mod challenge_responder;
pub mod directory;
pub mod nonce;
pub mod order;
pub mod signed_request;
pub mod types;

pub use account::Account;
pub use challenge_responder::ChallengeStore;
pub use directory::Directory;
pub use signed_request::{AcmeTransport, Auth};
