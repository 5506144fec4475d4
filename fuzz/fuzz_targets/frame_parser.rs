//! Fuzz target for frame parsing
//!
//! Tests that the frame parser and sub-packet decoder handle arbitrary
//! input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wbms_core::packet::split;
use wbms_core::{FrameKind, Message, parse_frame};

fuzz_target!(|data: &[u8]| {
    // The parser should never panic, only return Ok or Err
    if let Ok(FrameKind::Data { payload, .. }) = parse_frame(data) {
        for packet in split(payload).flatten() {
            let _ = Message::decode(packet);
        }
    }
});
