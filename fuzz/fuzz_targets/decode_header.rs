#![no_main]

use std::io::Cursor;

use cluster_rpc::Header;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Header::read_from must never panic on arbitrary (possibly
    // truncated or garbage) input.
    let mut cursor = Cursor::new(data);
    let _ = Header::read_from(&mut cursor);
});
