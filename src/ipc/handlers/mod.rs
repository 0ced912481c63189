pub mod cases;
pub mod core;
pub mod directory;
pub mod respondents;
pub mod session;
