//! One handler per action kind. The dispatcher resolves by kind and
//! acknowledges successful runs; handlers that must have their ack on
//! the wire before a restart (settings, unenroll) flush eagerly
//! themselves — the resulting duplicate is covered by at-least-once.

mod app_action;
mod cancel;
mod policy_change;
mod policy_reassign;
mod settings;
mod unenroll;
mod unknown;
mod upgrade;

pub use app_action::{AppActionHandler, AppBridge, NoopAppBridge};
pub use cancel::CancelHandler;
pub use policy_change::PolicyChangeHandler;
pub use policy_reassign::PolicyReassignHandler;
pub use settings::SettingsHandler;
pub use unenroll::UnenrollHandler;
pub use unknown::UnknownHandler;
pub use upgrade::UpgradeHandler;
