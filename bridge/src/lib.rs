mod bridge;
mod caches;
mod error;
mod format;
mod markdown;
mod permission;
mod state;
mod surface;

pub use bridge::{SessionBinding, StreamingBridge};
pub use caches::{normalize, EchoSuppressionSet, SessionBoundCache};
pub use error::{BridgeError, Result};
pub use format::{format_final_text, format_progress_bubble, format_streaming_update};
pub use markdown::{convert_markdown_to_html, escape_html, truncate_preserving_tags};
pub use permission::{PendingPermission, PendingPermissions};
pub use state::{StreamingState, Tokens, ToolCall};
pub use surface::{ChatSurface, InlineKeyboard, MessageOptions, SurfaceError, SurfaceResult};
