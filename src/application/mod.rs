// Application layer - use cases and orchestration over a LedgerStore

pub mod error;
pub mod invite;
pub mod ledger;

pub use error::*;
pub use invite::InviteService;
pub use ledger::LedgerService;
