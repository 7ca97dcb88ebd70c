pub mod key;
pub mod meta;
pub mod sync_source;

pub use key::*;
pub use meta::*;
pub use sync_source::*;
