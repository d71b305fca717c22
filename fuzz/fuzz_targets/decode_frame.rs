#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // frame::decode must never panic on arbitrary input, and a frame it
    // does accept must re-encode to a buffer that decodes back to an
    // identical frame.
    if let Ok(frame) = cluster_rpc::frame::decode(data) {
        let reencoded = cluster_rpc::frame::encode(&frame.header, &frame.credential, &frame.payload);
        let body = cluster_rpc::frame::strip_length_prefix(&reencoded).expect("just-encoded frame has a length prefix");
        let roundtripped = cluster_rpc::frame::decode(body).expect("re-encoding a decoded frame must decode cleanly");
        assert_eq!(roundtripped, frame);
    }
});
