pub mod auto_approver;
pub mod service;
pub mod signer;

pub use auto_approver::AutoApprover;
pub use service::ActionService;
pub use signer::{ActionSigner, Signer};
