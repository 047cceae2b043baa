pub mod install;
pub mod serve;
pub mod status;
pub mod sync;
