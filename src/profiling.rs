//! Tracy zones for the decode and capture hot paths.

use tracy_client::{Client, Span};

/// Open a zone that closes when the returned span is dropped. Does nothing
/// unless a Tracy client is running.
#[track_caller]
pub fn zone(name: &str) -> Option<Span> {
    let caller = std::panic::Location::caller();
    Client::running().map(|client| client.span_alloc(Some(name), name, caller.file(), caller.line(), 0))
}
