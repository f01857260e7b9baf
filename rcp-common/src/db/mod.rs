//! Database schema, row mapping and workspace settings

pub mod init;
pub mod responses;
pub mod settings;

pub use init::*;
pub use responses::*;
pub use settings::*;
