#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use mender_core::dependency::check_dependencies;
use mender_types::artifact::{ArtifactInfo, ArtifactProvides};

fuzz_target!(|data: &[u8]| {
    if let Ok(json_str) = std::str::from_utf8(data) {
        let Ok(depends) = serde_json::from_str::<BTreeMap<String, serde_json::Value>>(json_str) else {
            return;
        };

        let artifact = ArtifactInfo { type_info_depends: depends.clone(), ..Default::default() };

        // Every key explicitly stored as JSON null must fail its own
        // dependency without poisoning an otherwise-satisfied key.
        let mut provides = ArtifactProvides::default();
        for key in depends.keys() {
            provides.type_info_provides.insert(key.clone(), serde_json::Value::Null);
        }

        if let Err(mender_core::dependency::DependencyError::TypeInfoDepends { actual, .. }) =
            check_dependencies(&artifact, "qemux86-64", "", None, &provides)
        {
            assert_eq!(actual, None);
        }
    }
});
