mod account;
mod entry;
mod integrity;
mod invite;
mod page;

pub use account::*;
pub use entry::*;
pub use integrity::*;
pub use invite::*;
pub use page::*;
