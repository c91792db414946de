#![no_main]

use libfuzzer_sys::fuzz_target;

use domain::policy::proxyid::{parse_proxy_id, proxy_id};

// Parsing a proxy ID must never panic, and every successfully parsed ID
// must survive a format/parse roundtrip.
fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(parsed) = parse_proxy_id(input) {
        let formatted = proxy_id(
            parsed.endpoint_id,
            parsed.ingress,
            &parsed.protocol,
            parsed.port,
            &parsed.listener,
        );
        let reparsed = parse_proxy_id(&formatted).expect("formatted proxy ID must parse");
        assert_eq!(parsed.port, reparsed.port);
        assert_eq!(parsed.listener, reparsed.listener);
        assert_eq!(parsed.endpoint_id, reparsed.endpoint_id);
    }
});
