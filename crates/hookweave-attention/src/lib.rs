//! Hookweave Attention - Cross-attention hook management
//!
//! Installs contribution hooks into the cross-attention blocks of a host
//! U-Net and tears them down again.
//!
//! # Lifecycle
//!
//! ```text
//! Unpatched ──first hook──► Patched (HookedForward, hooks: [h0, h1, ..])
//!     ▲                         │
//!     └──── clear_all ──────────┘
//! ```
//!
//! Blocks are addressed with [`BlockLocation`]s (`input 4 1`, `middle 0 0`,
//! ...). [`UNetLayout`] lists the locations of the common U-Net variants and
//! can assemble a matching host graph skeleton.

pub mod forward;
pub mod layout;
pub mod locate;
pub mod registry;

pub use forward::HookedForward;
pub use layout::{HeadConfig, StageLayout, UNetLayout};
pub use locate::{BlockFlag, BlockLocation, locate};
pub use registry::HookRegistry;
