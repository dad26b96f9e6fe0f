//! CLI command handlers, one file per command.

mod add;
mod cancel;
mod checksum;
mod get;
mod pause;
mod remove;
mod report;
mod resume;
mod run;
mod status;

pub use add::{run_add, AddArgs};
pub use cancel::run_cancel;
pub use checksum::run_checksum;
pub use get::run_get;
pub use pause::run_pause;
pub use remove::run_remove;
pub use report::run_report;
pub use resume::run_resume;
pub use run::run_scheduler;
pub use status::run_status;
