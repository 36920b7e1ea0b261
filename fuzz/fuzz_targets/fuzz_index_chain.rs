//! Fuzz testing for the buffer file parser.
//!
//! Feeds arbitrary file images to the header reader and the index chain walk.
//! Malformed input must come back as an error, never a panic or a hang.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use tilebuf::format::{read_chain, read_header, BufferHeader};

#[derive(Debug, Arbitrary)]
struct ChainInput {
    /// Start the walk from the header's `next` or from this offset.
    start: Option<u64>,
    image: Vec<u8>,
}

fuzz_target!(|input: ChainInput| {
    let image: &[u8] = &input.image;

    let first = match read_header(image) {
        Ok(header) => {
            let _ = header.layout();
            let _ = header.extent();
            header.next()
        }
        Err(_) => 0,
    };

    let start = input.start.unwrap_or(first);
    if let Ok(blocks) = read_chain(image, start) {
        assert!(blocks.len() as u64 <= image.len() as u64 / 16);
        for block in blocks {
            let _ = block.key();
            let _ = block.offset();
        }
    }

    if image.len() >= 256 {
        let _ = BufferHeader::from_bytes(&image[..256]);
    }
});
