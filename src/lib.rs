//! # Live Cell
//!
//! Versioned observable values whose listeners are gated by activity.
//!
//! ## Features
//!
//! - **Activity gating**: listeners bound to an [`ActivitySource`] only hear
//!   values while the source is started, and detach themselves once it is destroyed
//! - **Exactly once per version**: a listener never sees the same write twice,
//!   no matter how often it is deactivated and reactivated
//! - **Sticky or fresh**: sticky listeners get the current value on activation,
//!   plain ones only hear later writes
//! - **Lazy mediators**: a [`Mediator`] attaches to its upstream cells only
//!   while someone is actively listening to it
//! - **Cross-thread posting**: [`LiveCell::post_write`] hands a value to the
//!   coordinating context from any thread, keeping only the latest
//!
//! ## Example
//!
//! ```rust,no_run
//! use live_cell::prelude::*;
//! use std::sync::Arc;
//!
//! let screen = Arc::new(Lifecycle::new());
//! let title: LiveCell<String> = LiveCell::new();
//!
//! let show = Listener::new(|title: &String| println!("title: {title}"));
//! title.listen_sticky(screen.clone(), &show)?;
//!
//! title.write("Inbox".to_string())?; // not started yet, nothing printed
//! screen.set_state(ActivityState::Started); // prints "title: Inbox"
//! # Ok::<(), CellError>(())
//! ```

mod activity;
mod binding;
mod cell;
mod context;
mod error;
mod listener;
mod mediator;
pub mod transform;

pub use activity::{ActivitySource, ActivityState, Lifecycle, ObserverKey, StateObserver};
pub use binding::ListenScope;
pub use cell::{ActivityHooks, CellId, LiveCell, WeakCell};
pub use context::MainContext;
pub use error::CellError;
pub use listener::{Listener, ListenerId};
pub use mediator::{Mediator, WeakMediator};

pub mod prelude {
    pub use crate::transform::{map, switch_map};
    pub use crate::{
        ActivityHooks, ActivitySource, ActivityState, CellError, Lifecycle, ListenScope, Listener,
        LiveCell, MainContext, Mediator,
    };
}
