// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// A single-capacity slot for the first message the client sent on a call. The
/// server-to-client forwarder writes into it once; every later write is dropped, matching the
/// "single-capacity channel" in the transparent proxy's design notes. Replay on transfer reads
/// a clone of whatever landed here, never the original the backend already consumed.
#[derive(Clone, Default)]
pub struct FirstMessageSlot(Arc<Mutex<Option<Bytes>>>);

impl FirstMessageSlot {
    pub fn new() -> Self {
        FirstMessageSlot::default()
    }

    pub fn set_if_empty(&self, message: Bytes) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub fn get(&self) -> Option<Bytes> {
        self.0.lock().unwrap().clone()
    }
}
