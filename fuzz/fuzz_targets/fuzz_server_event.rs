#![no_main]

use libfuzzer_sys::fuzz_target;
use spark_messaging_client::protocol::ServerEvent;

fuzz_target!(|data: &[u8]| {
    // Raw-byte path, including serde_json's UTF-8 validation.
    let _ = serde_json::from_slice::<ServerEvent>(data);

    // Anything that decodes must encode again and decode to the same value.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(event) = serde_json::from_str::<ServerEvent>(s) {
            if let Ok(text) = serde_json::to_string(&event) {
                let again = serde_json::from_str::<ServerEvent>(&text);
                assert_eq!(again.ok(), Some(event));
            }
        }
    }
});
