#![no_main]

use libfuzzer_sys::fuzz_target;
use mender_types::state_data::StateData;

fuzz_target!(|data: &[u8]| {
    if let Ok(json_str) = std::str::from_utf8(data) {
        if let Ok(state) = serde_json::from_str::<StateData>(json_str) {
            if let Ok(roundtripped) = serde_json::to_string(&state) {
                if let Ok(parsed) = serde_json::from_str::<StateData>(&roundtripped) {
                    assert_eq!(state.version, parsed.version);
                    assert_eq!(state.store_count, parsed.store_count);
                    assert_eq!(state.update_info.deployment_id, parsed.update_info.deployment_id);
                }
            }
        }
    }
});
