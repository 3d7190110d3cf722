mod contact;
mod id;
mod key;
pub mod messages;
mod routing_table;

pub use contact::*;
pub use id::*;
pub use key::*;
pub use routing_table::*;
