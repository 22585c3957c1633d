//! A screen-bound listener following a cell through a screen's lifecycle.
//!
//! This example shows:
//! - Plain and sticky listeners bound to a `Lifecycle`
//! - Values posted from a worker thread and drained on the main context
//! - A `map` mediator that only runs while someone is watching it
//!
//! Run with `RUST_LOG=live_cell=debug` to see sources plug and unplug.

use live_cell::prelude::*;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), CellError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let screen = Arc::new(Lifecycle::new());
    let unread: LiveCell<u32> = LiveCell::new();
    let badge = map(&unread, |count: &u32| match count {
        0 => "no new mail".to_string(),
        1 => "1 new message".to_string(),
        n => format!("{n} new messages"),
    })?;

    let show_badge = Listener::new(|badge: &String| println!("badge:  {badge}"));
    let show_count = Listener::new(|count: &u32| println!("count:  {count}"));
    badge.listen(screen.clone(), &show_badge)?;
    unread.listen_sticky(screen.clone(), &show_count)?;

    // Nothing is printed while the screen is only created.
    screen.set_state(ActivityState::Created);
    unread.write(3)?;

    println!("-- screen started");
    screen.set_state(ActivityState::Started);

    println!("-- worker posts a burst, only the last survives");
    let worker = unread.clone();
    thread::spawn(move || {
        for count in 4..=7 {
            worker.post_write(count);
        }
    })
    .join()
    .ok();
    unread.context().run_pending()?;

    println!("-- screen stopped, writes are held back");
    screen.set_state(ActivityState::Created);
    unread.write(1)?;

    println!("-- screen resumed, sticky listener catches up");
    screen.set_state(ActivityState::Resumed);
    unread.write(0)?;

    screen.destroy();
    println!(
        "-- screen destroyed, {} listeners left on the counter",
        unread.listener_count()
    );
    Ok(())
}
