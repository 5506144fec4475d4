//! Fuzz target for message decoding
//!
//! Bypasses the CRC so the decoder sees arbitrary sub-packet bodies.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use wbms_core::{Message, SubPacket};

#[derive(Debug, Arbitrary)]
struct Input {
    id: u8,
    body: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let packet = SubPacket {
        id: input.id,
        body: &input.body,
    };
    if let Ok(message) = Message::decode(packet) {
        let _ = message.encode_body();
    }
});
