//! Per-port handler map (spec §4.8 "Stream dispatch on inbound open", §6.4
//! "Handler map entries per label").
//!
//! Four entry kinds share the label namespace: `STREAM` (CodedByte or
//! RawByte), `RPC`, `MEDIA`, and `DIRECTOR` (resolved dynamically). A
//! single `raw_handler`, if configured, catches anything no label entry or
//! director claims.

use std::sync::Arc;

use crate::stream::{PayloadMode, StreamKind};

pub type StreamHandlerFn = Arc<dyn Fn(StreamKind) + Send + Sync>;
pub type RpcHandlerFn = Arc<dyn Fn() + Send + Sync>;
pub type MediaHandlerFn = Arc<dyn Fn() + Send + Sync>;
pub type DirectorFn = Arc<dyn Fn(&str) -> Option<HandlerEntry> + Send + Sync>;

#[derive(Clone)]
pub enum HandlerEntry {
    Stream { mode: PayloadMode, handler: StreamHandlerFn },
    Rpc(RpcHandlerFn),
    Media(MediaHandlerFn),
}

#[derive(Default)]
pub struct HandlerMap {
    entries: std::collections::HashMap<String, HandlerEntry>,
    director: Option<DirectorFn>,
    raw_handler: Option<HandlerEntry>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, label: impl Into<String>, entry: HandlerEntry) {
        self.entries.insert(label.into(), entry);
    }

    pub fn set_director(&mut self, director: DirectorFn) {
        self.director = Some(director);
    }

    pub fn set_raw_handler(&mut self, entry: HandlerEntry) {
        self.raw_handler = Some(entry);
    }

    /// Resolves a label to the entry that should handle an inbound stream
    /// open. Order: explicit entry, then the director, then the raw
    /// fallback, then rejection (spec §4.8: "First match wins among
    /// explicit entries; otherwise the director is consulted; otherwise the
    /// stream is rejected" — `raw_handler` is the last-resort catch-all
    /// §6.4 describes as receiving "all streams regardless of label").
    pub fn resolve(&self, label: &str) -> Option<HandlerEntry> {
        if let Some(entry) = self.entries.get(label) {
            return Some(entry.clone());
        }
        if let Some(director) = &self.director {
            if let Some(entry) = director(label) {
                return Some(entry);
            }
        }
        self.raw_handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn explicit_entry_wins_over_director_and_raw() {
        let mut map = HandlerMap::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        map.register(
            "echo",
            HandlerEntry::Stream {
                mode: PayloadMode::Binary,
                handler: Arc::new(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );
        map.set_director(Arc::new(|_| None));

        let entry = map.resolve("echo").expect("explicit match");
        if let HandlerEntry::Stream { handler, .. } = entry {
            handler(StreamKind::CodedByte);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn director_is_consulted_when_no_explicit_entry() {
        let mut map = HandlerMap::new();
        map.set_director(Arc::new(|label| {
            if label == "dynamic" {
                Some(HandlerEntry::Rpc(Arc::new(|| {})))
            } else {
                None
            }
        }));
        assert!(matches!(map.resolve("dynamic"), Some(HandlerEntry::Rpc(_))));
        assert!(map.resolve("unknown").is_none());
    }

    #[test]
    fn raw_handler_catches_anything_unclaimed() {
        let mut map = HandlerMap::new();
        map.set_raw_handler(HandlerEntry::Rpc(Arc::new(|| {})));
        assert!(map.resolve("anything-at-all").is_some());
    }
}
