//! Input/output helpers.
//!
//! - whitespace text matrices and signal files (`matrix`)
//! - FSL `bval`/`bvec` acquisition files (`scheme_io`)
//! - TOML model descriptions (`model_file`)
//! - result exports (JSON/CSV) (`export`)

pub mod export;
pub mod matrix;
pub mod model_file;
pub mod scheme_io;

pub use export::*;
pub use matrix::*;
pub use model_file::*;
pub use scheme_io::*;
