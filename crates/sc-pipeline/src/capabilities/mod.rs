//! Built-in capabilities.
//!
//! `outline`, `narration` and `title_card` let a run complete without any
//! external service. `command` and `http` adapt external programs and remote
//! endpoints to any stage.

mod command;
mod http;
mod narration;
mod outline;
mod title_card;

pub use command::CommandCapability;
pub use http::HttpCapability;
pub use narration::NarrationCapability;
pub use outline::OutlineCapability;
pub use title_card::{palette, Palette, TitleCardCapability, THEMES};
