pub mod vault;

pub use vault::{VaultPaths, VaultStats, build_vault, write_vault};
